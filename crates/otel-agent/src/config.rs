//! Configuration loading.
//!
//! The agent configuration is layered with figment. Later sources override
//! earlier ones:
//! 1. Compiled defaults (no components, no pipelines)
//! 2. Config file: `/etc/otel-agent/config.toml` unless another path is given
//! 3. Standard OpenTelemetry environment variables (`OTEL_EXPORTER_OTLP_*`)
//! 4. Agent variables with the `OTEL_AGENT_` prefix, nested on `__`
//!
//! # Supported Standard Environment Variables
//!
//! These only apply to the `otlphttp` exporter instance:
//!
//! | Variable | Config Path |
//! |----------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `exporters.otlphttp.endpoint` |
//! | `OTEL_EXPORTER_OTLP_HEADERS` | `exporters.otlphttp.headers` |
//! | `OTEL_EXPORTER_OTLP_COMPRESSION` | `exporters.otlphttp.compression` |
//!
//! # Agent Environment Variables
//!
//! Any key of the file can be set through the environment, for example
//! `OTEL_AGENT_EXPORTERS__OTLPHTTP__TIMEOUT=2000` sets
//! `exporters.otlphttp.timeout`. Instance names containing `/` cannot be
//! spelled this way and must live in the file.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use otel_agent_pipeline::{ComponentId, PipelineConfig, ServiceConfig};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Path read by [`load`].
pub const DEFAULT_CONFIG_PATH: &str = "/etc/otel-agent/config.toml";
const ENV_PREFIX: &str = "OTEL_AGENT_";
const ENV_SEPARATOR: &str = "__";

/// Configuration could not be assembled.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the expected layout.
    #[error("invalid configuration")]
    Figment(#[source] Box<figment::Error>),

    /// A component id handed to the builder is malformed.
    #[error("invalid component id {0:?}")]
    Id(String, #[source] otel_agent_pipeline::IdError),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Figment(Box::new(err))
    }
}

/// Loads the configuration from all sources.
///
/// # Errors
///
/// Returns an error if any source fails to parse.
pub fn load() -> Result<ServiceConfig, ConfigError> {
    load_from_path(DEFAULT_CONFIG_PATH)
}

/// Loads the configuration with the file layer read from `config_path`.
///
/// A missing file is skipped.
///
/// # Errors
///
/// Returns an error if any source fails to parse.
pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<ServiceConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ServiceConfig::default()));

    if config_path.as_ref().exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!(path = %config_path.as_ref().display(), "config file not found, skipping");
    }

    figment = figment.merge(standard_otel_env());
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR));

    Ok(figment.extract()?)
}

/// Partial exporter table for standard OTEL env var overrides.
#[derive(Debug, Default, Serialize)]
struct PartialExporterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

impl PartialExporterConfig {
    fn is_empty(&self) -> bool {
        self.endpoint.is_none() && self.compression.is_none() && self.headers.is_empty()
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    exporters: HashMap<&'static str, PartialExporterConfig>,
}

fn standard_otel_env() -> Serialized<PartialConfig> {
    let mut exporter = PartialExporterConfig::default();

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        exporter.endpoint = Some(endpoint);
    }

    if let Ok(compression) = std::env::var("OTEL_EXPORTER_OTLP_COMPRESSION") {
        exporter.compression = match compression.to_lowercase().as_str() {
            value @ ("gzip" | "none") => Some(value.to_string()),
            _ => None,
        };
    }

    if let Ok(headers) = std::env::var("OTEL_EXPORTER_OTLP_HEADERS") {
        for pair in headers.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                exporter
                    .headers
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }

    let mut config = PartialConfig::default();
    if !exporter.is_empty() {
        config.exporters.insert("otlphttp", exporter);
    }
    Serialized::defaults(config)
}

/// Builder for assembling a configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: ServiceConfig,
    errors: Vec<ConfigError>,
}

impl ConfigBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a receiver instance.
    pub fn receiver(mut self, id: &str, config: Value) -> Self {
        if let Some(id) = self.parse(id) {
            self.config.receivers.insert(id, config);
        }
        self
    }

    /// Declares a processor instance.
    pub fn processor(mut self, id: &str, config: Value) -> Self {
        if let Some(id) = self.parse(id) {
            self.config.processors.insert(id, config);
        }
        self
    }

    /// Declares an exporter instance.
    pub fn exporter(mut self, id: &str, config: Value) -> Self {
        if let Some(id) = self.parse(id) {
            self.config.exporters.insert(id, config);
        }
        self
    }

    /// Declares a connector instance.
    pub fn connector(mut self, id: &str, config: Value) -> Self {
        if let Some(id) = self.parse(id) {
            self.config.connectors.insert(id, config);
        }
        self
    }

    /// Declares an extension instance and enables it.
    pub fn extension(mut self, id: &str, config: Value) -> Self {
        if let Some(id) = self.parse(id) {
            self.config.extensions.insert(id.clone(), config);
            self.config.service.extensions.push(id);
        }
        self
    }

    /// Adds a pipeline such as `traces` or `logs/audit`.
    pub fn pipeline(
        mut self,
        id: &str,
        receivers: &[&str],
        processors: &[&str],
        exporters: &[&str],
    ) -> Self {
        let pipeline = PipelineConfig {
            receivers: self.parse_all(receivers),
            processors: self.parse_all(processors),
            exporters: self.parse_all(exporters),
        };
        self.config.service.pipelines.insert(id.to_string(), pipeline);
        self
    }

    /// Returns the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first malformed component id.
    pub fn build(mut self) -> Result<ServiceConfig, ConfigError> {
        if !self.errors.is_empty() {
            return Err(self.errors.swap_remove(0));
        }
        Ok(self.config)
    }

    fn parse(&mut self, id: &str) -> Option<ComponentId> {
        match id.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                self.errors.push(ConfigError::Id(id.to_string(), e));
                None
            }
        }
    }

    fn parse_all(&mut self, ids: &[&str]) -> Vec<ComponentId> {
        ids.iter().filter_map(|id| self.parse(id)).collect()
    }
}

/// An empty component table, for instances that keep every default.
pub fn defaults() -> Value {
    Value::Object(Map::new())
}
