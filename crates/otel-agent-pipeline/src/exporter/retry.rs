//! Exponential backoff with jitter for transient export failures.

use crate::config::duration_ms;
use crate::consumer::ConsumeError;
use crate::context::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Retry policy of an exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether transient failures are retried at all.
    pub enabled: bool,
    /// Delay before the first retry, in milliseconds.
    #[serde(with = "duration_ms")]
    pub initial_interval: Duration,
    /// Each delay is picked from `delay * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
    /// Growth of the delay between consecutive retries.
    pub multiplier: f64,
    /// Upper bound of the delay, in milliseconds.
    #[serde(with = "duration_ms")]
    pub max_interval: Duration,
    /// Time after which retrying gives up, in milliseconds. Zero retries
    /// forever.
    #[serde(with = "duration_ms")]
    pub max_elapsed_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: Duration::from_secs(5),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Checks that the policy describes a finite, growing backoff.
    ///
    /// A disabled policy is never consulted and always passes.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "retry_on_failure.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(format!(
                "retry_on_failure.randomization_factor must be within [0, 1], got {}",
                self.randomization_factor
            ));
        }
        if self.initial_interval.is_zero() || self.max_interval.is_zero() {
            return Err("retry_on_failure intervals must be positive".to_string());
        }
        if self.initial_interval > self.max_interval {
            return Err(format!(
                "retry_on_failure.initial_interval ({}ms) exceeds max_interval ({}ms)",
                self.initial_interval.as_millis(),
                self.max_interval.as_millis()
            ));
        }
        Ok(())
    }
}

/// Returned as the permanent error once the retry budget is spent.
#[derive(Debug, thiserror::Error)]
#[error("no more retries left: {0}")]
pub struct RetriesExhausted(#[source] pub ConsumeError);

pub(crate) struct Backoff<'a> {
    config: &'a RetryConfig,
    current: Duration,
    started: Instant,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(config: &'a RetryConfig) -> Self {
        Self {
            config,
            current: config.initial_interval,
            started: Instant::now(),
        }
    }

    /// Returns the next delay, or `None` when waiting it would exceed the
    /// elapsed time budget.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        let delay = jitter(self.current, self.config.randomization_factor);
        let max_elapsed = self.config.max_elapsed_time;
        if !max_elapsed.is_zero() && self.started.elapsed().saturating_add(delay) > max_elapsed {
            return None;
        }
        let multiplier = self.config.multiplier;
        let grown = if multiplier.is_finite() && multiplier > 1.0 {
            Duration::try_from_secs_f64(self.current.as_secs_f64() * multiplier).ok()
        } else {
            Some(self.current)
        };
        self.current = grown
            .unwrap_or(self.config.max_interval)
            .min(self.config.max_interval);
        Some(delay)
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor.is_nan() || factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = base * factor.min(1.0);
    let picked = rand::rng().random_range((base - delta)..=(base + delta));
    Duration::try_from_secs_f64(picked).unwrap_or(interval)
}

/// Runs `attempt` until it succeeds, fails permanently, or the policy gives up.
///
/// A cancelled `ctx` aborts the wait with [`ConsumeError::Cancelled`]; a
/// cancelled `stop` token aborts it with [`ConsumeError::Shutdown`] wrapping
/// the last failure.
pub(crate) async fn retry<F, Fut>(
    config: &RetryConfig,
    ctx: &Context,
    stop: &CancellationToken,
    mut attempt: F,
) -> Result<(), ConsumeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ConsumeError>>,
{
    if !config.enabled {
        return attempt().await;
    }

    let mut backoff = Backoff::new(config);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err = match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => e,
        };

        let Some(delay) = backoff.next_delay() else {
            return Err(ConsumeError::permanent(RetriesExhausted(err)));
        };
        tracing::info!(
            error = %err,
            attempts,
            interval_ms = delay.as_millis() as u64,
            "Exporting failed. Will retry the request after interval."
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.cancelled() => return Err(ConsumeError::Cancelled),
            _ = stop.cancelled() => return Err(ConsumeError::Shutdown(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            initial_interval: Duration::from_millis(100),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: Duration::from_millis(400),
            max_elapsed_time: Duration::from_secs(2),
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_interval, Duration::from_secs(5));
        assert_eq!(config.randomization_factor, 0.5);
        assert_eq!(config.multiplier, 1.5);
        assert_eq!(config.max_interval, Duration::from_secs(30));
        assert_eq!(config.max_elapsed_time, Duration::from_secs(300));
    }

    #[test]
    fn test_config_uses_milliseconds() {
        let config: RetryConfig =
            serde_json::from_value(serde_json::json!({ "initial_interval": 250 })).unwrap();
        assert_eq!(config.initial_interval, Duration::from_millis(250));
        assert_eq!(config.max_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let interval = Duration::from_secs(10);
        for _ in 0..100 {
            let delay = jitter(interval, 0.5);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_validate_rejects_unusable_policies() {
        assert!(RetryConfig::default().validate().is_ok());

        let invalid = [
            json!({ "multiplier": 0.5 }),
            json!({ "multiplier": -2.0 }),
            json!({ "randomization_factor": 1.5 }),
            json!({ "randomization_factor": -0.1 }),
            json!({ "initial_interval": 0 }),
            json!({ "initial_interval": 60_000, "max_interval": 1_000 }),
        ];
        for user in invalid {
            let config: RetryConfig = serde_json::from_value(user.clone()).unwrap();
            assert!(config.validate().is_err(), "accepted {user}");
        }

        let disabled: RetryConfig =
            serde_json::from_value(json!({ "enabled": false, "multiplier": 0.0 })).unwrap();
        assert!(disabled.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_survives_huge_multiplier() {
        let config = RetryConfig {
            multiplier: 1e300,
            randomization_factor: 0.0,
            ..fast_config()
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_jitter_ignores_nan_factor() {
        let interval = Duration::from_secs(1);
        assert_eq!(jitter(interval, f64::NAN), interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_to_max_interval() {
        let config = fast_config();
        let mut backoff = Backoff::new(&config);
        let delays: Vec<u64> = (0..4)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 400]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_after_max_elapsed() {
        let config = fast_config();
        let mut backoff = Backoff::new(&config);
        tokio::time::advance(Duration::from_millis(1950)).await;
        assert!(backoff.next_delay().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry(
            &fast_config(),
            &Context::background(),
            &CancellationToken::new(),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ConsumeError::transient("unavailable"))
                } else {
                    Ok(())
                }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let err = retry(
            &fast_config(),
            &Context::background(),
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConsumeError::permanent("bad request"))
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_permanent() {
        let err = retry(
            &fast_config(),
            &Context::background(),
            &CancellationToken::new(),
            || async { Err(ConsumeError::transient("unavailable")) },
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("no more retries left"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_context_aborts_wait() {
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let err = retry(&fast_config(), &ctx, &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            ctx.cancel();
            Err(ConsumeError::transient("unavailable"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ConsumeError::Cancelled));
        assert!(!err.is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_token_interrupts_with_shutdown_error() {
        let stop = CancellationToken::new();
        let err = retry(&fast_config(), &Context::background(), &stop, || async {
            stop.cancel();
            Err(ConsumeError::transient("unavailable"))
        })
        .await
        .unwrap_err();
        assert!(err.is_shutdown());
        assert!(err.to_string().starts_with("interrupted due to shutdown"));
    }

    #[tokio::test]
    async fn test_disabled_makes_one_attempt() {
        let config = RetryConfig {
            enabled: false,
            ..fast_config()
        };
        let calls = AtomicUsize::new(0);
        let err = retry(
            &config,
            &Context::background(),
            &CancellationToken::new(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConsumeError::transient("unavailable"))
            },
        )
        .await
        .unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
