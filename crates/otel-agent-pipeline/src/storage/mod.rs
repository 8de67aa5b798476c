//! Storage extension contract used by persistent queues.
//!
//! A storage extension hands out [`StorageClient`]s, each scoped to one
//! namespace derived from the requesting component. Clients are plain
//! key-value stores with a batch operation; a batch is applied in order and
//! get operations receive their value in place.

mod memory;

pub use memory::{MemoryStorage, MemoryStorageFactory};

use crate::component::{ComponentId, Kind};
use crate::consumer::BoxError;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by storage clients and extensions.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    /// The client was used after [`StorageClient::close`].
    #[error("storage client is closed")]
    Closed,

    /// Filesystem failure.
    #[error("storage I/O error")]
    Io(#[from] std::io::Error),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StorageError {
    /// Wraps a backend specific failure.
    pub fn backend(error: impl Into<BoxError>) -> Self {
        Self::Backend(error.into())
    }
}

/// What a batched [`Operation`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Reads the key into [`Operation::value`].
    Get,
    /// Writes [`Operation::value`] to the key.
    Set,
    /// Removes the key.
    Delete,
}

/// One step of a storage batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Kind of the step.
    pub kind: OpKind,
    /// Key the step addresses.
    pub key: String,
    /// Value written by a set, or read by a get (`None` when absent).
    pub value: Option<Vec<u8>>,
}

impl Operation {
    /// A read of `key`.
    pub fn get(key: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Get,
            key: key.into(),
            value: None,
        }
    }

    /// A write of `value` to `key`.
    pub fn set(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            kind: OpKind::Set,
            key: key.into(),
            value: Some(value),
        }
    }

    /// A removal of `key`.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            key: key.into(),
            value: None,
        }
    }
}

/// Key-value handle into one storage namespace.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Applies `ops` in order. Get operations have their value filled in.
    async fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError>;

    /// Releases the client. Further calls fail with [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;

    /// Reads `key`; `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut ops = [Operation::get(key)];
        self.batch(&mut ops).await?;
        let [op] = ops;
        Ok(op.value)
    }

    /// Writes `value` to `key`.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.batch(&mut [Operation::set(key, value)]).await
    }

    /// Removes `key`; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.batch(&mut [Operation::delete(key)]).await
    }
}

/// Capability of an extension to provide storage clients.
#[async_trait]
pub trait StorageExtension: Send + Sync {
    /// Returns a client for the namespace of (`kind`, `owner`, `name`).
    async fn get_client(
        &self,
        kind: Kind,
        owner: &ComponentId,
        name: &str,
    ) -> Result<Arc<dyn StorageClient>, StorageError>;
}

/// Builds the namespace a client is scoped to, e.g.
/// `exporter_otlphttp_primary_traces`.
pub fn client_namespace(kind: Kind, owner: &ComponentId, name: &str) -> String {
    let mut namespace = format!("{kind}_{}", owner.component_type());
    if let Some(owner_name) = owner.name() {
        namespace.push('_');
        namespace.push_str(owner_name);
    }
    if !name.is_empty() {
        namespace.push('_');
        namespace.push_str(name);
    }
    namespace
}
