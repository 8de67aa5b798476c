//! Sending queues placed in front of an exporter's send path.
//!
//! Two implementations share the [`Queue`] contract:
//!
//! - [`MemoryQueue`]: a bounded in-process channel drained by a worker pool
//! - [`PersistentQueue`]: a FIFO kept in a storage extension, surviving
//!   restarts with at-least-once delivery
//!
//! Producers never block on capacity: an offer to a full queue fails at once
//! with [`QueueError::QueueFull`].

pub mod index;
mod memory;
mod persistent;

pub use memory::MemoryQueue;
pub use persistent::PersistentQueue;

use crate::component::{ComponentId, Host, Kind};
use crate::consumer::ConsumeError;
use crate::context::Context;
use crate::storage::StorageError;
use async_trait::async_trait;
use otel_agent_pdata::{Batch, DecodeError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by a [`SendFn`].
pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), ConsumeError>> + Send>>;

/// The send path workers call for every dequeued batch.
pub type SendFn<T> = Arc<dyn Fn(Context, T) -> SendFuture + Send + Sync>;

/// Called with every batch a queue rejects.
pub type DropFn<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Boxes an async closure into a [`SendFn`].
pub fn send_fn<T, F, Fut>(f: F) -> SendFn<T>
where
    T: Batch,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    Arc::new(move |ctx: Context, batch: T| -> SendFuture { Box::pin(f(ctx, batch)) })
}

/// Errors raised by queues.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is at capacity or stopped.
    #[error("sending queue is full")]
    QueueFull,

    /// A persistent queue was offered data before it was started.
    #[error("sending queue is not started")]
    NotStarted,

    /// The storage extension is missing or could not create a client.
    #[error("storage client for \"{id}\" not available")]
    NoStorageClient {
        /// Id of the configured storage extension.
        id: ComponentId,
        /// Failure of the extension, if it was found.
        #[source]
        source: Option<StorageError>,
    },

    /// The named extension does not provide storage.
    #[error("extension \"{0}\" is not a storage extension")]
    WrongExtensionType(ComponentId),

    /// A storage operation failed.
    #[error("storage operation failed")]
    Storage(#[from] StorageError),

    /// A stored item could not be decoded.
    #[error("stored item could not be decoded")]
    Decode(#[from] DecodeError),

    /// A stored index key holds malformed bytes.
    #[error("invalid index encoding: {0}")]
    InvalidIndex(&'static str),
}

impl From<QueueError> for ConsumeError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull => ConsumeError::QueueFull,
            QueueError::Decode(e) => ConsumeError::permanent(e),
            other => ConsumeError::transient(other),
        }
    }
}

/// A sending queue of batches of `T`.
#[async_trait]
pub trait Queue<T: Batch>: Send + Sync {
    /// Adds a batch, failing at once when the queue cannot take it.
    async fn offer(&self, ctx: &Context, batch: T) -> Result<(), QueueError>;

    /// Opens storage if any, recovers pending items and spawns the workers.
    async fn start(&self, host: &dyn Host) -> Result<(), QueueError>;

    /// Rejects further offers and waits for the workers to exit.
    async fn shutdown(&self) -> Result<(), QueueError>;

    /// Number of queued items, excluding those being sent.
    fn size(&self) -> usize;

    /// Maximum number of queued items.
    fn capacity(&self) -> usize;

    /// Whether items survive a restart.
    fn is_persistent(&self) -> bool;
}

/// User-facing queue settings of an exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Whether batches go through a queue at all.
    pub enabled: bool,
    /// Number of workers draining the queue.
    pub num_consumers: usize,
    /// Maximum number of queued batches.
    pub queue_size: usize,
    /// Storage extension backing a persistent queue; memory when unset.
    pub storage: Option<ComponentId>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_consumers: 10,
            queue_size: 1000,
            storage: None,
        }
    }
}

/// Everything a queue needs besides its configuration.
pub struct QueueSettings<T> {
    /// Id of the exporter owning the queue.
    pub owner: ComponentId,
    /// Kind of the owner, used for the storage namespace.
    pub kind: Kind,
    /// Send path invoked by the workers.
    pub send: SendFn<T>,
    /// Called with each rejected batch.
    pub on_drop: Option<DropFn<T>>,
}

/// Builds the queue described by `config`.
///
/// Returns `None` when queueing is disabled.
pub fn build_queue<T: Batch>(
    config: &QueueConfig,
    settings: QueueSettings<T>,
) -> Option<Arc<dyn Queue<T>>> {
    if !config.enabled {
        return None;
    }
    let queue: Arc<dyn Queue<T>> = match &config.storage {
        Some(storage) => Arc::new(PersistentQueue::new(
            config.queue_size,
            config.num_consumers,
            storage.clone(),
            settings,
        )),
        None => Arc::new(MemoryQueue::new(
            config.queue_size,
            config.num_consumers,
            settings.send,
            settings.on_drop,
        )),
    };
    Some(queue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert!(config.enabled);
        assert_eq!(config.num_consumers, 10);
        assert_eq!(config.queue_size, 1000);
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: QueueConfig =
            serde_json::from_value(serde_json::json!({ "storage": "file_storage/queue" }))
                .unwrap();
        assert_eq!(config.queue_size, 1000);
        assert_eq!(config.storage.unwrap().to_string(), "file_storage/queue");
    }

    #[test]
    fn test_queue_full_maps_to_permanent_consume_error() {
        let err: ConsumeError = QueueError::QueueFull.into();
        assert!(err.is_queue_full());
        assert!(err.is_permanent());

        let err: ConsumeError = QueueError::Storage(StorageError::Closed).into();
        assert!(!err.is_permanent());
    }
}
