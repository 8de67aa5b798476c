//! Timeout, retry and queueing around an exporter's send function.
//!
//! An exporter implements [`Export`] for the signals it supports and wraps
//! itself in an [`ExporterHelper`], which turns it into a pipeline consumer:
//!
//! ```text
//! consume ──► [sending queue] ──► retry ──► timeout ──► Export::export
//! ```
//!
//! With the queue disabled the caller waits for the whole retry sequence.
//! With it enabled `consume` returns once the batch is queued and the queue's
//! workers drive the rest.

mod retry;

pub use retry::{RetriesExhausted, RetryConfig};

use crate::component::{Component, ComponentId, CreateSettings, Host};
use crate::config::duration_ms;
use crate::consumer::{Capabilities, ConsumeError, Consumer};
use crate::context::Context;
use crate::error::ComponentError;
use crate::queue::{DropFn, Queue, QueueConfig, QueueSettings, build_queue, send_fn};
use async_trait::async_trait;
use otel_agent_pdata::Batch;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Sends one batch of `T` to its destination.
#[async_trait]
pub trait Export<T: Batch>: Send + Sync + 'static {
    /// Sends `batch`. Called once per attempt; the batch is borrowed so that
    /// a retry can resend it.
    async fn export(&self, ctx: &Context, batch: &T) -> Result<(), ConsumeError>;

    /// Acquires resources such as connections.
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Releases resources. Called after the queue has drained.
    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Whether the exporter modifies batches before sending them.
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }
}

/// Settings every exporter embeds in its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Bound on one export attempt, in milliseconds. Zero disables it.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Retry policy for transient failures.
    pub retry_on_failure: RetryConfig,
    /// Sending queue in front of the retry loop.
    pub sending_queue: QueueConfig,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_on_failure: RetryConfig::default(),
            sending_queue: QueueConfig::default(),
        }
    }
}

/// An export attempt ran out of time.
#[derive(Debug, Error)]
#[error("export attempt timed out after {0:?}")]
pub struct Timeout(pub Duration);

/// Item counters of one exporter instance.
#[derive(Debug, Default)]
pub struct ExporterCounters {
    sent: AtomicU64,
    send_failed: AtomicU64,
    enqueue_failed: AtomicU64,
}

impl ExporterCounters {
    /// Items delivered successfully.
    pub fn sent_items(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Items dropped after the last attempt failed.
    pub fn send_failed_items(&self) -> u64 {
        self.send_failed.load(Ordering::Relaxed)
    }

    /// Items the sending queue refused or discarded.
    pub fn enqueue_failed_items(&self) -> u64 {
        self.enqueue_failed.load(Ordering::Relaxed)
    }
}

/// The part of the helper shared with queue workers.
struct Sender<T: Batch> {
    id: ComponentId,
    exporter: Arc<dyn Export<T>>,
    timeout: Duration,
    retry: RetryConfig,
    stop: CancellationToken,
    counters: Arc<ExporterCounters>,
}

impl<T: Batch> Sender<T> {
    async fn send(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        let items = batch.item_count() as u64;
        let result = retry::retry(&self.retry, ctx, &self.stop, || self.attempt(ctx, &batch)).await;
        match &result {
            Ok(()) => {
                self.counters.sent.fetch_add(items, Ordering::Relaxed);
            }
            Err(e) if e.is_shutdown() => {
                tracing::warn!(exporter = %self.id, error = %e, items, "Exporting interrupted by shutdown.");
            }
            Err(e) => {
                self.counters.send_failed.fetch_add(items, Ordering::Relaxed);
                tracing::error!(exporter = %self.id, error = %e, dropped_items = items, "Exporting failed. Dropping data.");
            }
        }
        result
    }

    async fn attempt(&self, ctx: &Context, batch: &T) -> Result<(), ConsumeError> {
        if self.timeout.is_zero() {
            return self.exporter.export(ctx, batch).await;
        }
        let attempt_ctx = ctx.child();
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.timeout, self.exporter.export(&attempt_ctx, batch)) => {
                result.map_err(|_| ConsumeError::transient(Timeout(self.timeout)))
            }
            _ = ctx.cancelled() => Err(ConsumeError::Cancelled),
        };
        // Lets a still running export observe that its attempt is over.
        attempt_ctx.cancel();
        outcome?
    }
}

/// Turns an [`Export`] implementation into a pipeline exporter.
pub struct ExporterHelper<T: Batch> {
    sender: Arc<Sender<T>>,
    queue: Option<Arc<dyn Queue<T>>>,
    span: tracing::Span,
}

impl<T: Batch> ExporterHelper<T> {
    /// Wraps `exporter` according to `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidConfig`] when the retry policy cannot
    /// produce a usable backoff.
    pub fn new(
        settings: &CreateSettings,
        config: &HelperConfig,
        exporter: Arc<dyn Export<T>>,
    ) -> Result<Self, ComponentError> {
        config
            .retry_on_failure
            .validate()
            .map_err(|reason| ComponentError::InvalidConfig {
                id: settings.id.clone(),
                source: serde::de::Error::custom(reason),
            })?;

        let counters = Arc::new(ExporterCounters::default());
        let sender = Arc::new(Sender {
            id: settings.id.clone(),
            exporter,
            timeout: config.timeout,
            retry: config.retry_on_failure.clone(),
            stop: CancellationToken::new(),
            counters: Arc::clone(&counters),
        });

        let worker_sender = Arc::clone(&sender);
        let send = send_fn(move |ctx: Context, batch: T| {
            let sender = Arc::clone(&worker_sender);
            async move { sender.send(&ctx, batch).await }
        });
        let on_drop: DropFn<T> = Arc::new(move |batch: T| {
            counters
                .enqueue_failed
                .fetch_add(batch.item_count() as u64, Ordering::Relaxed);
        });
        let queue = build_queue(
            &config.sending_queue,
            QueueSettings {
                owner: settings.id.clone(),
                kind: settings.kind,
                send,
                on_drop: Some(on_drop),
            },
        );

        Ok(Self {
            sender,
            queue,
            span: settings.span.clone(),
        })
    }

    /// Returns the item counters of this exporter.
    pub fn counters(&self) -> &ExporterCounters {
        &self.sender.counters
    }

    /// Returns the sending queue, if enabled.
    pub fn queue(&self) -> Option<&Arc<dyn Queue<T>>> {
        self.queue.as_ref()
    }

    /// Stops the queue and the exporter after a partial start, closing a
    /// storage client the queue may already hold.
    async fn release_after_failed_start(&self) {
        if let Some(queue) = &self.queue
            && let Err(e) = queue.shutdown().await
        {
            tracing::warn!(exporter = %self.sender.id, error = %e, "queue shutdown after failed start");
        }
        if let Err(e) = self.sender.exporter.shutdown().await {
            tracing::warn!(exporter = %self.sender.id, error = %e, "shutdown after failed start");
        }
    }
}

#[async_trait]
impl<T: Batch> Consumer<T> for ExporterHelper<T> {
    fn capabilities(&self) -> Capabilities {
        self.sender.exporter.capabilities()
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        let Some(queue) = &self.queue else {
            return self
                .sender
                .send(ctx, batch)
                .instrument(self.span.clone())
                .await;
        };
        let items = batch.item_count();
        queue.offer(ctx, batch).await.map_err(|e| {
            let _enter = self.span.enter();
            tracing::error!(error = %e, rejected_items = items, "Exporting failed. Rejecting data.");
            ConsumeError::from(e)
        })
    }
}

#[async_trait]
impl<T: Batch> Component for ExporterHelper<T> {
    async fn start(&self, host: &dyn Host) -> Result<(), ComponentError> {
        if let Err(e) = self.sender.exporter.start(host).await {
            self.release_after_failed_start().await;
            return Err(e);
        }
        if let Some(queue) = &self.queue
            && let Err(e) = queue.start(host).await
        {
            self.release_after_failed_start().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        // Pending retries give up first so that the queue can drain.
        self.sender.stop.cancel();
        let mut errors = Vec::new();
        if let Some(queue) = &self.queue
            && let Err(e) = queue.shutdown().await
        {
            errors.push(ComponentError::from(e));
        }
        if let Err(e) = self.sender.exporter.shutdown().await {
            errors.push(e);
        }
        ComponentError::join(errors)
    }
}
