//! Exporters shipped with the agent.

pub mod debug;
pub mod otlphttp;

use otel_agent_pipeline::{ComponentError, CreateSettings};
use serde_json::Value;
use std::collections::BTreeMap;

pub use debug::{DebugConfig, DebugExporterFactory, Verbosity};
pub use otlphttp::{Compression, ExportError, OtlpHttpConfig, OtlpHttpExporter, OtlpHttpExporterFactory};

/// Fails creation when the configuration table held keys no setting claimed.
///
/// Exporter settings flatten [`otel_agent_pipeline::HelperConfig`], which
/// rules out `deny_unknown_fields`; leftovers are collected instead.
fn reject_unknown_keys(
    settings: &CreateSettings,
    unknown: &BTreeMap<String, Value>,
) -> Result<(), ComponentError> {
    if unknown.is_empty() {
        return Ok(());
    }
    let keys = unknown
        .keys()
        .map(|key| format!("`{key}`"))
        .collect::<Vec<_>>()
        .join(", ");
    Err(ComponentError::InvalidConfig {
        id: settings.id.clone(),
        source: serde::de::Error::custom(format!("unknown field(s) {keys}")),
    })
}
