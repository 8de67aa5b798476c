//! Batch processor.
//!
//! Accumulates incoming batches of one signal and forwards them as one merged
//! batch once `send_batch_size` items are pending or `timeout` has passed
//! since the last flush. Whatever is pending at shutdown is flushed before
//! the processor stops.
//!
//! A size-triggered flush runs on the caller's task, so its error reaches the
//! caller. Timer and shutdown flushes have no caller and log their errors.

use crate::components::default_config;
use async_trait::async_trait;
use otel_agent_pipeline::config::duration_ms;
use otel_agent_pipeline::factory::{DynProcessor, Factory, ProcessorFactory};
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces};
use otel_agent_pipeline::{
    Capabilities, Component, ComponentConfig, ComponentError, ComponentType, ConsumeError,
    Consumer, Context, CreateSettings, DynConsumer, Host, StabilityLevel,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Settings of a `batch` processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Pending item count that triggers a flush.
    pub send_batch_size: usize,
    /// Longest time data waits before a flush, in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: 8192,
            timeout: Duration::from_millis(200),
        }
    }
}

/// Batches whose requests can be concatenated.
pub trait Merge: Batch {
    /// Moves every resource entry of `other` to the end of `self`.
    fn merge(&mut self, other: Self);
}

impl Merge for Traces {
    fn merge(&mut self, other: Self) {
        let other = other.into_request().resource_spans;
        self.request_mut().resource_spans.extend(other);
    }
}

impl Merge for Metrics {
    fn merge(&mut self, other: Self) {
        let other = other.into_request().resource_metrics;
        self.request_mut().resource_metrics.extend(other);
    }
}

impl Merge for Logs {
    fn merge(&mut self, other: Self) {
        let other = other.into_request().resource_logs;
        self.request_mut().resource_logs.extend(other);
    }
}

struct Pending<T> {
    batch: Option<T>,
    items: usize,
}

impl<T: Merge> Pending<T> {
    fn push(&mut self, batch: T) {
        self.items += batch.item_count();
        match &mut self.batch {
            Some(pending) => pending.merge(batch),
            None => self.batch = Some(batch),
        }
    }

    fn take(&mut self) -> Option<T> {
        self.items = 0;
        self.batch.take()
    }
}

/// Merges small batches of `T` into larger ones.
pub struct BatchProcessor<T: Merge> {
    config: BatchConfig,
    next: DynConsumer<T>,
    pending: Arc<Mutex<Pending<T>>>,
    stop: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
    span: tracing::Span,
}

impl<T: Merge> BatchProcessor<T> {
    /// Creates a processor forwarding to `next`.
    pub fn new(settings: &CreateSettings, config: BatchConfig, next: DynConsumer<T>) -> Self {
        Self {
            config,
            next,
            pending: Arc::new(Mutex::new(Pending {
                batch: None,
                items: 0,
            })),
            stop: CancellationToken::new(),
            timer: Mutex::new(None),
            span: settings.span.clone(),
        }
    }

    /// Number of items waiting for the next flush.
    pub fn pending_items(&self) -> usize {
        lock(&self.pending).items
    }
}

fn lock<T>(pending: &Mutex<Pending<T>>) -> std::sync::MutexGuard<'_, Pending<T>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn flush<T: Merge>(pending: &Mutex<Pending<T>>, next: &DynConsumer<T>, reason: &str) {
    let batch = lock(pending).take();
    let Some(batch) = batch else {
        return;
    };
    let items = batch.item_count();
    if let Err(e) = next.consume(&Context::background(), batch).await {
        tracing::warn!(error = %e, items, reason, "failed to send batch");
    }
}

#[async_trait]
impl<T: Merge> Consumer<T> for BatchProcessor<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        let full = {
            let mut pending = lock(&self.pending);
            pending.push(batch);
            if pending.items >= self.config.send_batch_size {
                pending.take()
            } else {
                None
            }
        };
        match full {
            Some(batch) => self.next.consume(ctx, batch).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T: Merge> Component for BatchProcessor<T> {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        let pending = Arc::clone(&self.pending);
        let next = Arc::clone(&self.next);
        let stop = self.stop.clone();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.timeout,
            self.config.timeout,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timer = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => flush(&pending, &next, "timeout").await,
                    }
                }
            }
            .instrument(self.span.clone()),
        );
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.stop.cancel();
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }
        flush(&self.pending, &self.next, "shutdown")
            .instrument(self.span.clone())
            .await;
        Ok(())
    }
}

/// Factory for `batch` processors.
#[derive(Debug, Default)]
pub struct BatchProcessorFactory;

impl BatchProcessorFactory {
    fn create<T: Merge>(
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<T>,
    ) -> Result<Arc<BatchProcessor<T>>, ComponentError> {
        let config: BatchConfig = config.parse()?;
        if config.timeout.is_zero() {
            return Err(ComponentError::InvalidConfig {
                id: settings.id.clone(),
                source: serde::de::Error::custom("timeout must be positive"),
            });
        }
        Ok(Arc::new(BatchProcessor::new(settings, config, next)))
    }
}

impl Factory for BatchProcessorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("batch")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<BatchConfig>()
    }
}

impl ProcessorFactory for BatchProcessorFactory {
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn create_traces(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Traces>,
    ) -> Result<DynProcessor<Traces>, ComponentError> {
        Ok(Self::create(settings, config, next)?)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynProcessor<Metrics>, ComponentError> {
        Ok(Self::create(settings, config, next)?)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Logs>,
    ) -> Result<DynProcessor<Logs>, ComponentError> {
        Ok(Self::create(settings, config, next)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otel_agent_pipeline::testing::{SinkConsumer, StaticHost, logs_with_records};
    use otel_agent_pipeline::{BuildInfo, Kind};
    use serde_json::json;

    fn settings() -> CreateSettings {
        CreateSettings::new("batch".parse().unwrap(), Kind::Processor, BuildInfo::default())
    }

    fn processor(
        send_batch_size: usize,
        timeout: Duration,
    ) -> (BatchProcessor<Logs>, Arc<SinkConsumer<Logs>>) {
        let sink = Arc::new(SinkConsumer::new());
        let config = BatchConfig {
            send_batch_size,
            timeout,
        };
        (BatchProcessor::new(&settings(), config, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_size_threshold_flushes_merged_batch() {
        let (batch, sink) = processor(5, Duration::from_secs(60));
        let ctx = Context::background();

        batch.consume(&ctx, logs_with_records(3)).await.unwrap();
        assert_eq!(sink.batch_count(), 0);
        assert_eq!(batch.pending_items(), 3);

        batch.consume(&ctx, logs_with_records(3)).await.unwrap();
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(sink.item_count(), 6);
        assert_eq!(sink.batches()[0].resource_logs().len(), 2);
        assert_eq!(batch.pending_items(), 0);
    }

    #[tokio::test]
    async fn test_size_flush_error_reaches_caller() {
        let (batch, sink) = processor(1, Duration::from_secs(60));
        sink.fail_with(|| ConsumeError::permanent("rejected"));

        let err = batch
            .consume(&Context::background(), logs_with_records(2))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flushes_pending() {
        let (batch, sink) = processor(1000, Duration::from_millis(200));
        batch.start(&StaticHost::new()).await.unwrap();

        batch
            .consume(&Context::background(), logs_with_records(2))
            .await
            .unwrap();
        assert_eq!(sink.batch_count(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.batch_count(), 1);
        assert_eq!(sink.item_count(), 2);

        // Nothing pending, nothing sent.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.batch_count(), 1);

        batch.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let (batch, sink) = processor(1000, Duration::from_secs(60));
        batch.start(&StaticHost::new()).await.unwrap();
        batch
            .consume(&Context::background(), logs_with_records(4))
            .await
            .unwrap();

        batch.shutdown().await.unwrap();
        assert_eq!(sink.item_count(), 4);
    }

    #[tokio::test]
    async fn test_shared_input_is_not_modified() {
        let (batch, sink) = processor(1000, Duration::from_secs(60));
        let ctx = Context::background();
        let mut original = logs_with_records(1);
        let shared = original.as_shared();

        batch.consume(&ctx, shared).await.unwrap();
        batch.consume(&ctx, logs_with_records(1)).await.unwrap();
        batch.shutdown().await.unwrap();

        assert_eq!(original.log_record_count(), 1);
        assert_eq!(sink.item_count(), 2);
    }

    #[test]
    fn test_factory_rejects_zero_timeout() {
        let factory = BatchProcessorFactory;
        let config = ComponentConfig::merged(
            "batch".parse().unwrap(),
            factory.create_default_config(),
            Some(&json!({"timeout": 0})),
        );
        let next: DynConsumer<Logs> = Arc::new(SinkConsumer::new());
        let err = factory.create_logs(&settings(), &config, next).err().unwrap();
        assert!(err.to_string().contains("timeout must be positive"));
    }

    #[test]
    fn test_default_config() {
        let factory = BatchProcessorFactory;
        assert_eq!(
            factory.create_default_config(),
            json!({"send_batch_size": 8192, "timeout": 200})
        );
    }
}
