//! The component set compiled into the agent.

use crate::connector::{CountConnectorFactory, ForwardConnectorFactory};
use crate::exporter::{DebugExporterFactory, OtlpHttpExporterFactory};
use crate::extension::FileStorageFactory;
use crate::processor::{BatchProcessorFactory, ResourceProcessorFactory};
use crate::receiver::OtlpReceiverFactory;
use otel_agent_pipeline::storage::MemoryStorageFactory;
use otel_agent_pipeline::{Factories, RegistryError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Serializes a component's default settings.
pub(crate) fn default_config<C: Serialize + Default>() -> Value {
    serde_json::to_value(C::default()).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Returns registries holding every built-in factory.
///
/// # Errors
///
/// Returns an error if two factories share a type, which would be a bug in
/// this function.
pub fn default_factories() -> Result<Factories, RegistryError> {
    Factories::new()
        .with_receiver(Arc::new(OtlpReceiverFactory::new()))?
        .with_processor(Arc::new(BatchProcessorFactory))?
        .with_processor(Arc::new(ResourceProcessorFactory))?
        .with_exporter(Arc::new(OtlpHttpExporterFactory))?
        .with_exporter(Arc::new(DebugExporterFactory))?
        .with_connector(Arc::new(ForwardConnectorFactory))?
        .with_connector(Arc::new(CountConnectorFactory))?
        .with_extension(Arc::new(FileStorageFactory))?
        .with_extension(Arc::new(MemoryStorageFactory::new()))
}
