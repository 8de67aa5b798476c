//! Exporter that writes what it receives to the agent's own log.

use crate::components::default_config;
use async_trait::async_trait;
use otel_agent_pipeline::factory::{DynExporter, ExporterFactory, Factory};
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces};
use otel_agent_pipeline::{
    ComponentConfig, ComponentError, ComponentType, ConsumeError, Context, CreateSettings, Export,
    ExporterHelper, HelperConfig, StabilityLevel,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How much of each batch is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Item counts only.
    #[default]
    Basic,
    /// Item counts plus the resource attributes of every resource.
    Detailed,
}

/// Settings of a `debug` exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Level of detail.
    pub verbosity: Verbosity,
    /// Timeout, retry and queue settings; queue and retry are off by default.
    #[serde(flatten)]
    pub helper: HelperConfig,
    /// Keys no other field claimed; creation fails unless empty.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Default for DebugConfig {
    fn default() -> Self {
        let mut helper = HelperConfig::default();
        helper.sending_queue.enabled = false;
        helper.retry_on_failure.enabled = false;
        Self {
            verbosity: Verbosity::Basic,
            helper,
            unknown: BTreeMap::new(),
        }
    }
}

/// Describes a batch for the log line.
pub trait Describe: Batch {
    /// Short per-signal counts, e.g. `resource_spans=1 spans=3`.
    fn summary(&self) -> String;

    /// Resource attributes, one entry per resource.
    fn resources(&self) -> Vec<String>;
}

fn describe_resource(resource: Option<&otel_agent_pipeline::pdata::proto::resource::v1::Resource>) -> String {
    let Some(resource) = resource else {
        return String::from("{}");
    };
    let attributes: Vec<String> = resource
        .attributes
        .iter()
        .map(|kv| format!("{}={:?}", kv.key, kv.value.as_ref().and_then(|v| v.value.as_ref())))
        .collect();
    format!("{{{}}}", attributes.join(", "))
}

impl Describe for Traces {
    fn summary(&self) -> String {
        format!(
            "resource_spans={} spans={}",
            self.request().resource_spans.len(),
            self.span_count()
        )
    }

    fn resources(&self) -> Vec<String> {
        self.request()
            .resource_spans
            .iter()
            .map(|rs| describe_resource(rs.resource.as_ref()))
            .collect()
    }
}

impl Describe for Metrics {
    fn summary(&self) -> String {
        format!(
            "resource_metrics={} metrics={} data_points={}",
            self.request().resource_metrics.len(),
            self.metric_count(),
            self.data_point_count()
        )
    }

    fn resources(&self) -> Vec<String> {
        self.request()
            .resource_metrics
            .iter()
            .map(|rm| describe_resource(rm.resource.as_ref()))
            .collect()
    }
}

impl Describe for Logs {
    fn summary(&self) -> String {
        format!(
            "resource_logs={} log_records={}",
            self.request().resource_logs.len(),
            self.log_record_count()
        )
    }

    fn resources(&self) -> Vec<String> {
        self.request()
            .resource_logs
            .iter()
            .map(|rl| describe_resource(rl.resource.as_ref()))
            .collect()
    }
}

/// Logs each batch at info level.
pub struct DebugExporter {
    id: String,
    verbosity: Verbosity,
}

#[async_trait]
impl<T: Describe> Export<T> for DebugExporter {
    async fn export(&self, _ctx: &Context, batch: &T) -> Result<(), ConsumeError> {
        tracing::info!(exporter = %self.id, signal = T::SIGNAL, "{}", batch.summary());
        if self.verbosity == Verbosity::Detailed {
            for (index, resource) in batch.resources().iter().enumerate() {
                tracing::info!(exporter = %self.id, index, "Resource {}", resource);
            }
        }
        Ok(())
    }
}

/// Factory for `debug` exporters.
#[derive(Debug, Default)]
pub struct DebugExporterFactory;

impl DebugExporterFactory {
    fn create<T: Describe>(
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<Arc<ExporterHelper<T>>, ComponentError> {
        let config: DebugConfig = config.parse()?;
        super::reject_unknown_keys(settings, &config.unknown)?;
        let exporter: Arc<dyn Export<T>> = Arc::new(DebugExporter {
            id: settings.id.to_string(),
            verbosity: config.verbosity,
        });
        Ok(Arc::new(ExporterHelper::new(settings, &config.helper, exporter)?))
    }
}

impl Factory for DebugExporterFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("debug")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<DebugConfig>()
    }
}

impl ExporterFactory for DebugExporterFactory {
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Development
    }

    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Development
    }

    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Development
    }

    fn create_traces(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<Traces>, ComponentError> {
        Ok(Self::create::<Traces>(settings, config)?)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<Metrics>, ComponentError> {
        Ok(Self::create::<Metrics>(settings, config)?)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<Logs>, ComponentError> {
        Ok(Self::create::<Logs>(settings, config)?)
    }
}
