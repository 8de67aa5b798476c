//! Declarative service configuration.
//!
//! The configuration names every component instance once, in the table of its
//! kind, and then wires instances into pipelines by id:
//!
//! ```toml
//! [receivers.otlp]
//! [processors."batch/fast"]
//! timeout = 200
//! [exporters.otlphttp]
//! endpoint = "http://collector:4318"
//!
//! [service.pipelines.traces]
//! receivers = ["otlp"]
//! processors = ["batch/fast"]
//! exporters = ["otlphttp"]
//! ```
//!
//! Component tables stay untyped here; each factory decodes its own table
//! after it is merged over the factory's defaults.

use crate::component::ComponentId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Serde adapter storing a [`std::time::Duration`] as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Writes the duration as milliseconds.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Reads milliseconds into a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// The whole agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Receiver instances by id.
    pub receivers: BTreeMap<ComponentId, Value>,
    /// Processor instances by id.
    pub processors: BTreeMap<ComponentId, Value>,
    /// Exporter instances by id.
    pub exporters: BTreeMap<ComponentId, Value>,
    /// Connector instances by id.
    pub connectors: BTreeMap<ComponentId, Value>,
    /// Extension instances by id.
    pub extensions: BTreeMap<ComponentId, Value>,
    /// Which instances run and how they are wired.
    pub service: ServiceSection,
}

/// The `service` section: enabled extensions and pipelines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    /// Extensions to run, in start order.
    pub extensions: Vec<ComponentId>,
    /// Pipelines keyed by their textual id, e.g. `traces/sampled`.
    pub pipelines: BTreeMap<String, PipelineConfig>,
}

/// The components of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Receivers or connectors feeding the pipeline.
    pub receivers: Vec<ComponentId>,
    /// Processors, applied in order.
    pub processors: Vec<ComponentId>,
    /// Exporters or connectors the pipeline ends in.
    pub exporters: Vec<ComponentId>,
}

impl PipelineConfig {
    /// Creates a pipeline from textual ids.
    ///
    /// # Panics
    ///
    /// Panics if any id is malformed. Meant for tests and static wiring.
    pub fn from_ids(receivers: &[&str], processors: &[&str], exporters: &[&str]) -> Self {
        fn parse(ids: &[&str]) -> Vec<ComponentId> {
            ids.iter()
                .map(|id| match id.parse() {
                    Ok(id) => id,
                    Err(e) => panic!("invalid component id {id:?}: {e}"),
                })
                .collect()
        }
        Self {
            receivers: parse(receivers),
            processors: parse(processors),
            exporters: parse(exporters),
        }
    }
}

impl ServiceConfig {
    /// Returns the configuration table of a connector, if configured.
    pub fn connector(&self, id: &ComponentId) -> Option<&Value> {
        self.connectors.get(id)
    }

    /// Returns whether any pipeline references `id`.
    pub fn is_referenced(&self, id: &ComponentId) -> bool {
        self.service.pipelines.values().any(|p| {
            p.receivers.contains(id) || p.processors.contains(id) || p.exporters.contains(id)
        })
    }
}
