//! OTLP/HTTP receiver.
//!
//! Serves `/v1/traces`, `/v1/metrics` and `/v1/logs` for protobuf or JSON
//! bodies, optionally gzip compressed, plus a `/health` endpoint. One HTTP server
//! runs per receiver id no matter how many signals it is wired into.
//!
//! Pipeline errors map onto HTTP statuses so clients know whether to retry:
//! permanent failures answer 400, everything else 503.
//! A compressed body that inflates past `max_request_body_size` answers 413.

use crate::components::default_config;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_ENCODING, CONTENT_TYPE},
    },
    routing::{get, post},
};
use flate2::read::GzDecoder;
use otel_agent_pipeline::config::duration_ms;
use otel_agent_pipeline::factory::{DynReceiver, Factory, ReceiverFactory};
use otel_agent_pipeline::pdata::proto::collector::{
    logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
    trace::v1::ExportTraceServiceRequest,
};
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces};
use otel_agent_pipeline::sharedcomponent::{SharedComponent, SharedComponents};
use otel_agent_pipeline::{
    Component, ComponentConfig, ComponentError, ComponentId, ComponentType, Context,
    CreateSettings, DynConsumer, Host, StabilityLevel,
};
use prost::Message;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Settings of an `otlp` receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OtlpReceiverConfig {
    /// Address the HTTP server binds to.
    pub endpoint: SocketAddr,
    /// Largest accepted request body, in bytes, before decompression.
    pub max_request_body_size: usize,
    /// Time allowed for in-flight requests to finish on shutdown, in
    /// milliseconds.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for OtlpReceiverConfig {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([127, 0, 0, 1], 4318)),
            max_request_body_size: 20 * 1024 * 1024,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `ready` once the server answers.
    pub status: &'static str,
    /// Number of export requests accepted so far.
    pub requests_received: u64,
}

/// Factory for `otlp` receivers.
#[derive(Default)]
pub struct OtlpReceiverFactory {
    receivers: SharedComponents<OtlpReceiver>,
}

impl OtlpReceiverFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bound address of the running receiver `id`.
    ///
    /// Useful when the configured port is 0.
    pub fn local_addr(&self, id: &ComponentId) -> Option<SocketAddr> {
        self.receivers
            .get(id)
            .and_then(|shared| shared.inner().local_addr())
    }

    fn shared(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<Arc<SharedComponent<OtlpReceiver>>, ComponentError> {
        let config: OtlpReceiverConfig = config.parse()?;
        self.receivers
            .get_or_add(&settings.id, || Ok(OtlpReceiver::new(settings, config)))
    }
}

impl Factory for OtlpReceiverFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("otlp")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<OtlpReceiverConfig>()
    }
}

impl ReceiverFactory for OtlpReceiverFactory {
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn create_traces(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Traces>,
    ) -> Result<DynReceiver, ComponentError> {
        let shared = self.shared(settings, config)?;
        shared.inner().consumers().traces = Some(next);
        Ok(shared)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynReceiver, ComponentError> {
        let shared = self.shared(settings, config)?;
        shared.inner().consumers().metrics = Some(next);
        Ok(shared)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Logs>,
    ) -> Result<DynReceiver, ComponentError> {
        let shared = self.shared(settings, config)?;
        shared.inner().consumers().logs = Some(next);
        Ok(shared)
    }
}

#[derive(Default, Clone)]
struct Consumers {
    traces: Option<DynConsumer<Traces>>,
    metrics: Option<DynConsumer<Metrics>>,
    logs: Option<DynConsumer<Logs>>,
}

/// A running OTLP/HTTP server feeding up to three pipelines.
pub struct OtlpReceiver {
    config: OtlpReceiverConfig,
    span: tracing::Span,
    consumers: Mutex<Consumers>,
    cancel_token: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl OtlpReceiver {
    fn new(settings: &CreateSettings, config: OtlpReceiverConfig) -> Self {
        Self {
            config,
            span: settings.span.clone(),
            consumers: Mutex::new(Consumers::default()),
            cancel_token: CancellationToken::new(),
            local_addr: OnceLock::new(),
            server: Mutex::new(None),
        }
    }

    /// Returns the bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn consumers(&self) -> std::sync::MutexGuard<'_, Consumers> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Component for OtlpReceiver {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        let listener = TcpListener::bind(self.config.endpoint)
            .await
            .map_err(ComponentError::start)?;
        let local_addr = listener.local_addr().map_err(ComponentError::start)?;
        let _ = self.local_addr.set(local_addr);

        let consumers = self.consumers().clone();
        let state = Arc::new(ReceiverState {
            consumers,
            requests_received: AtomicU64::new(0),
            max_body_size: self.config.max_request_body_size,
            cancel_token: self.cancel_token.clone(),
            span: self.span.clone(),
        });

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/v1/traces", post(handle_traces))
            .route("/v1/metrics", post(handle_metrics))
            .route("/v1/logs", post(handle_logs))
            .layer(DefaultBodyLimit::max(self.config.max_request_body_size))
            .with_state(state);

        tracing::info!(parent: &self.span, endpoint = %local_addr, "OTLP HTTP receiver started");

        let cancel_token = self.cancel_token.clone();
        let server = tokio::spawn(
            async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(cancel_token.cancelled_owned())
                    .await
                {
                    tracing::error!(error = %e, "OTLP HTTP server failed");
                }
            }
            .instrument(self.span.clone()),
        );
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.cancel_token.cancel();
        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(server) = server
            && tokio::time::timeout(self.config.shutdown_timeout, server)
                .await
                .is_err()
        {
            tracing::warn!(parent: &self.span, "OTLP HTTP server did not stop in time");
        }
        Ok(())
    }
}

struct ReceiverState {
    consumers: Consumers,
    requests_received: AtomicU64,
    max_body_size: usize,
    cancel_token: CancellationToken,
    span: tracing::Span,
}

async fn handle_health(State(state): State<Arc<ReceiverState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ready",
        requests_received: state.requests_received.load(Ordering::Relaxed),
    })
}

async fn handle_traces(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(next) = &state.consumers.traces else {
        return StatusCode::NOT_FOUND;
    };
    receive::<ExportTraceServiceRequest, Traces>(&state, next, &headers, &body).await
}

async fn handle_metrics(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(next) = &state.consumers.metrics else {
        return StatusCode::NOT_FOUND;
    };
    receive::<ExportMetricsServiceRequest, Metrics>(&state, next, &headers, &body).await
}

async fn handle_logs(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(next) = &state.consumers.logs else {
        return StatusCode::NOT_FOUND;
    };
    receive::<ExportLogsServiceRequest, Logs>(&state, next, &headers, &body).await
}

async fn receive<R, T>(
    state: &ReceiverState,
    next: &DynConsumer<T>,
    headers: &HeaderMap,
    body: &Bytes,
) -> StatusCode
where
    R: Message + Default + serde::de::DeserializeOwned,
    T: Batch + From<R>,
{
    let request = match parse_request::<R>(
        headers.get(CONTENT_TYPE),
        headers.get(CONTENT_ENCODING),
        body,
        state.max_body_size,
    ) {
        Ok(request) => request,
        Err(status) => return status,
    };
    let batch = T::from(request);
    let items = batch.item_count();

    let ctx = Context::from_token(state.cancel_token.child_token());
    match next.consume(&ctx, batch).await {
        Ok(()) => {
            state.requests_received.fetch_add(1, Ordering::Relaxed);
            StatusCode::OK
        }
        Err(e) if e.is_permanent() => {
            tracing::warn!(parent: &state.span, error = %e, signal = T::SIGNAL, items, "rejecting data permanently");
            StatusCode::BAD_REQUEST
        }
        Err(e) => {
            tracing::warn!(parent: &state.span, error = %e, signal = T::SIGNAL, items, "pipeline busy, signalling backpressure");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn parse_request<T>(
    content_type: Option<&HeaderValue>,
    content_encoding: Option<&HeaderValue>,
    body: &Bytes,
    max_body_size: usize,
) -> Result<T, StatusCode>
where
    T: Message + Default + serde::de::DeserializeOwned,
{
    let is_gzip = content_encoding
        .and_then(|ce| ce.to_str().ok())
        .is_some_and(|ce| ce.contains("gzip"));

    let decompressed: Vec<u8>;
    let body_bytes: &[u8] = if is_gzip {
        decompressed = decompress_gzip(body, max_body_size)?;
        &decompressed
    } else {
        body.as_ref()
    };

    let is_json = content_type
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if is_json {
        serde_json::from_slice(body_bytes).map_err(|e| {
            tracing::debug!(error = %e, "failed to parse JSON request");
            StatusCode::BAD_REQUEST
        })
    } else {
        T::decode(body_bytes).map_err(|e| {
            tracing::debug!(error = %e, "failed to parse protobuf request");
            StatusCode::BAD_REQUEST
        })
    }
}

/// Inflates a gzip body, refusing output larger than `limit` bytes.
fn decompress_gzip(body: &Bytes, limit: usize) -> Result<Vec<u8>, StatusCode> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut decoder = GzDecoder::new(body.as_ref()).take(cap);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| {
        tracing::debug!(error = %e, "failed to decompress gzip body");
        StatusCode::BAD_REQUEST
    })?;
    if decompressed.len() > limit {
        tracing::debug!(limit, "decompressed body exceeds the request size limit");
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    Ok(decompressed)
}
