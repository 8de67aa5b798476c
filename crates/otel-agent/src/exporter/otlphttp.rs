//! OTLP/HTTP exporter.
//!
//! Posts each batch as an OTLP protobuf request to `{endpoint}/v1/{signal}`,
//! optionally gzip compressed. Timeouts, retries and queueing come from the
//! exporter helper; this module only performs one attempt and classifies its
//! outcome. Retryable per the OTLP specification: 408, 429, every 5xx and
//! transport failures. Every other non-success status is permanent.

use crate::components::default_config;
use async_trait::async_trait;
use otel_agent_pipeline::factory::{DynExporter, ExporterFactory, Factory};
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces};
use otel_agent_pipeline::{
    ComponentConfig, ComponentError, ComponentType, ConsumeError, Context, CreateSettings, Export,
    ExporterHelper, HelperConfig, StabilityLevel,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::Arc;

/// Compression applied to request bodies.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    None,
    /// Gzip compression.
    #[default]
    Gzip,
}

/// Settings of an `otlphttp` exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtlpHttpConfig {
    /// Base URL; the signal path is appended.
    pub endpoint: Option<String>,
    /// Compression algorithm.
    pub compression: Compression,
    /// Additional headers to send with requests.
    pub headers: HashMap<String, String>,
    /// Timeout, retry and queue settings.
    #[serde(flatten)]
    pub helper: HelperConfig,
    /// Keys no other field claimed; creation fails unless empty.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl Default for OtlpHttpConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            compression: Compression::Gzip,
            headers: HashMap::new(),
            helper: HelperConfig::default(),
            unknown: BTreeMap::new(),
        }
    }
}

/// Error during one export attempt.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// HTTP request failed.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code returned by server.
        status: u16,
        /// Response body from server.
        body: String,
    },

    /// Compression failed.
    #[error("failed to encode request")]
    Encode(#[source] std::io::Error),
}

impl ExportError {
    pub(crate) fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Http(_) => true,
            ExportError::Status { status, .. } => is_retryable(*status),
            ExportError::Encode(_) => false,
        }
    }
}

/// Determines if a status code is retryable per the OTLP specification.
///
/// Retryable: 408 (Request Timeout), 429 (Too Many Requests), 5xx (Server Errors)
fn is_retryable(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

impl From<ExportError> for ConsumeError {
    fn from(err: ExportError) -> Self {
        if err.is_retryable() {
            ConsumeError::transient(err)
        } else {
            ConsumeError::permanent(err)
        }
    }
}

/// Sends batches to one OTLP/HTTP endpoint.
pub struct OtlpHttpExporter {
    endpoint: String,
    compression: Compression,
    headers: HashMap<String, String>,
    client: Client,
}

impl OtlpHttpExporter {
    /// Creates an exporter for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: String, config: &OtlpHttpConfig) -> Result<Self, ExportError> {
        let client = Client::builder().build().map_err(ExportError::Http)?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            compression: config.compression,
            headers: config.headers.clone(),
            client,
        })
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<(), ExportError> {
        let url = format!("{}{}", self.endpoint, path);
        let body = self.compress(body)?;

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-protobuf")
            .body(body);

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        if self.compression == Compression::Gzip {
            request = request.header("Content-Encoding", "gzip");
        }

        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ExportError::status(status.as_u16(), body))
        }
    }

    fn compress(&self, buf: Vec<u8>) -> Result<Vec<u8>, ExportError> {
        if self.compression == Compression::Gzip {
            use flate2::Compression as GzCompression;
            use flate2::write::GzEncoder;

            let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
            encoder.write_all(&buf).map_err(ExportError::Encode)?;
            encoder.finish().map_err(ExportError::Encode)
        } else {
            Ok(buf)
        }
    }

    async fn export_batch<T: Batch>(&self, ctx: &Context, path: &str, batch: &T) -> Result<(), ConsumeError> {
        tokio::select! {
            result = self.post(path, batch.marshal()) => result.map_err(ConsumeError::from),
            () = ctx.cancelled() => Err(ConsumeError::Cancelled),
        }
    }
}

#[async_trait]
impl Export<Traces> for OtlpHttpExporter {
    async fn export(&self, ctx: &Context, batch: &Traces) -> Result<(), ConsumeError> {
        self.export_batch(ctx, "/v1/traces", batch).await
    }
}

#[async_trait]
impl Export<Metrics> for OtlpHttpExporter {
    async fn export(&self, ctx: &Context, batch: &Metrics) -> Result<(), ConsumeError> {
        self.export_batch(ctx, "/v1/metrics", batch).await
    }
}

#[async_trait]
impl Export<Logs> for OtlpHttpExporter {
    async fn export(&self, ctx: &Context, batch: &Logs) -> Result<(), ConsumeError> {
        self.export_batch(ctx, "/v1/logs", batch).await
    }
}

/// Factory for `otlphttp` exporters.
#[derive(Debug, Default)]
pub struct OtlpHttpExporterFactory;

impl OtlpHttpExporterFactory {
    fn create<T: Batch>(
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<Arc<ExporterHelper<T>>, ComponentError>
    where
        OtlpHttpExporter: Export<T>,
    {
        let config: OtlpHttpConfig = config.parse()?;
        super::reject_unknown_keys(settings, &config.unknown)?;
        let Some(endpoint) = config.endpoint.clone() else {
            return Err(ComponentError::InvalidConfig {
                id: settings.id.clone(),
                source: serde::de::Error::custom("endpoint is required"),
            });
        };
        let exporter = OtlpHttpExporter::new(endpoint, &config).map_err(ComponentError::start)?;
        let exporter: Arc<dyn Export<T>> = Arc::new(exporter);
        Ok(Arc::new(ExporterHelper::new(settings, &config.helper, exporter)?))
    }
}

impl Factory for OtlpHttpExporterFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("otlphttp")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<OtlpHttpConfig>()
    }
}

impl ExporterFactory for OtlpHttpExporterFactory {
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Stable
    }

    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Stable
    }

    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
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
