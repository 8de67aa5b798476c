//! Process-lifetime storage extension.
//!
//! Data lives as long as the factory that created the extension, so a queue
//! stopped and started again within one process finds its items. Useful for
//! tests and for agents that only need to survive pipeline rebuilds.

use super::{OpKind, Operation, StorageClient, StorageError, StorageExtension, client_namespace};
use crate::component::{
    Component, ComponentId, ComponentType, CreateSettings, Extension, Host, Kind, StabilityLevel,
};
use crate::error::ComponentError;
use crate::factory::{ComponentConfig, ExtensionFactory, Factory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Namespace = HashMap<String, Vec<u8>>;
type Shared = Arc<Mutex<HashMap<String, Namespace>>>;

/// In-memory storage extension.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Shared,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys stored in `namespace`.
    pub fn key_count(&self, namespace: &str) -> usize {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl Component for MemoryStorage {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl Extension for MemoryStorage {
    fn as_storage(&self) -> Option<&dyn StorageExtension> {
        Some(self)
    }
}

#[async_trait]
impl StorageExtension for MemoryStorage {
    async fn get_client(
        &self,
        kind: Kind,
        owner: &ComponentId,
        name: &str,
    ) -> Result<Arc<dyn StorageClient>, StorageError> {
        Ok(Arc::new(MemoryClient {
            namespace: client_namespace(kind, owner, name),
            data: Arc::clone(&self.data),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryClient {
    namespace: String,
    data: Shared,
    closed: AtomicBool,
}

#[async_trait]
impl StorageClient for MemoryClient {
    async fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let namespace = data.entry(self.namespace.clone()).or_default();
        for op in ops.iter_mut() {
            match op.kind {
                OpKind::Get => op.value = namespace.get(&op.key).cloned(),
                OpKind::Set => {
                    namespace.insert(op.key.clone(), op.value.clone().unwrap_or_default());
                }
                OpKind::Delete => {
                    namespace.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Factory for `memory_storage` extensions.
///
/// Extensions created for the same id share one store for the lifetime of the
/// factory.
#[derive(Debug, Default)]
pub struct MemoryStorageFactory {
    stores: Mutex<HashMap<ComponentId, MemoryStorage>>,
}

impl MemoryStorageFactory {
    /// Creates a factory with no stores.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Factory for MemoryStorageFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("memory_storage")
    }
}

impl ExtensionFactory for MemoryStorageFactory {
    fn stability(&self) -> StabilityLevel {
        StabilityLevel::Development
    }

    fn create(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
    ) -> Result<Arc<dyn Extension>, ComponentError> {
        let store = self
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(settings.id.clone())
            .or_default()
            .clone();
        Ok(Arc::new(store))
    }
}
