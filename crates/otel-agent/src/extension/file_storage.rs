//! Storage extension keeping each key in its own file.
//!
//! Layout: `{directory}/{namespace}/{hex(key)}`. Writes land in a temporary
//! file first and are renamed into place, so a crash leaves either the old
//! or the new value behind, never a torn one.

use crate::components::default_config;
use async_trait::async_trait;
use otel_agent_pipeline::factory::{ExtensionFactory, Factory};
use otel_agent_pipeline::storage::{OpKind, Operation, client_namespace};
use otel_agent_pipeline::{
    Component, ComponentConfig, ComponentError, ComponentId, ComponentType, CreateSettings,
    Extension, Host, Kind, StabilityLevel, StorageClient, StorageError, StorageExtension,
};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

const TMP_SUFFIX: &str = ".tmp";

/// Settings of a `file_storage` extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileStorageConfig {
    /// Root directory; one subdirectory per client namespace.
    pub directory: PathBuf,
    /// Create the root directory on start when it is missing.
    pub create_directory: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/otel-agent/file_storage"),
            create_directory: true,
        }
    }
}

/// Filesystem backed storage extension.
#[derive(Debug)]
pub struct FileStorage {
    config: FileStorageConfig,
}

impl FileStorage {
    /// Creates an extension rooted at `config.directory`.
    pub fn new(config: FileStorageConfig) -> Self {
        Self { config }
    }

    /// Returns the root directory.
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }
}

#[async_trait]
impl Component for FileStorage {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        let directory = &self.config.directory;
        if self.config.create_directory {
            tokio::fs::create_dir_all(directory)
                .await
                .map_err(ComponentError::start)?;
        }
        let metadata = tokio::fs::metadata(directory).await.map_err(|e| {
            ComponentError::start(format!("storage directory {}: {e}", directory.display()))
        })?;
        if !metadata.is_dir() {
            return Err(ComponentError::start(format!(
                "storage path {} is not a directory",
                directory.display()
            )));
        }
        tracing::debug!(directory = %directory.display(), "File storage ready");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl Extension for FileStorage {
    fn as_storage(&self) -> Option<&dyn StorageExtension> {
        Some(self)
    }
}

#[async_trait]
impl StorageExtension for FileStorage {
    async fn get_client(
        &self,
        kind: Kind,
        owner: &ComponentId,
        name: &str,
    ) -> Result<Arc<dyn StorageClient>, StorageError> {
        let namespace = sanitize(&client_namespace(kind, owner, name));
        let directory = self.config.directory.join(namespace);
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Arc::new(FileClient {
            directory,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Keeps namespace directories to one path component.
fn sanitize(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '~'
            }
        })
        .collect()
}

struct FileClient {
    directory: PathBuf,
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileClient {
    fn path(&self, key: &str) -> PathBuf {
        self.directory.join(hex::encode(key))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageClient for FileClient {
    async fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        let _guard = self.lock.lock().await;
        for op in ops.iter_mut() {
            match op.kind {
                OpKind::Get => op.value = self.read(&op.key).await?,
                OpKind::Set => {
                    let value = op.value.as_deref().unwrap_or_default();
                    self.write(&op.key, value).await?;
                }
                OpKind::Delete => self.remove(&op.key).await?,
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Factory for `file_storage` extensions.
#[derive(Debug, Default)]
pub struct FileStorageFactory;

impl Factory for FileStorageFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("file_storage")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<FileStorageConfig>()
    }
}

impl ExtensionFactory for FileStorageFactory {
    fn stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn create(
        &self,
        _settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<Arc<dyn Extension>, ComponentError> {
        let config: FileStorageConfig = config.parse()?;
        Ok(Arc::new(FileStorage::new(config)))
    }
}
