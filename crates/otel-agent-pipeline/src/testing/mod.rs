//! Test doubles for components, hosts and storage.
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! downstream crates that exercise their components against the runtime.

mod factories;

pub use factories::{
    TestConnectorFactory, TestExporterFactory, TestExtensionFactory, TestFactories,
    TestProcessorFactory, TestReceiverFactory,
};

use crate::component::{Component, ComponentId, Extension, Host, Kind};
use crate::consumer::{Capabilities, ConsumeError, Consumer};
use crate::context::Context;
use crate::error::ComponentError;
use crate::storage::{MemoryStorage, Operation, StorageClient, StorageError, StorageExtension};
use async_trait::async_trait;
use otel_agent_pdata::proto::collector::logs::v1::ExportLogsServiceRequest;
use otel_agent_pdata::proto::collector::metrics::v1::ExportMetricsServiceRequest;
use otel_agent_pdata::proto::collector::trace::v1::ExportTraceServiceRequest;
use otel_agent_pdata::proto::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use otel_agent_pdata::proto::metrics::v1::{
    Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, metric, number_data_point,
};
use otel_agent_pdata::proto::resource::v1::Resource;
use otel_agent_pdata::proto::trace::v1::{ResourceSpans, ScopeSpans, Span};
use otel_agent_pdata::{Batch, Logs, Metrics, Traces};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A consumer that keeps every batch it receives.
pub struct SinkConsumer<T: Batch> {
    capabilities: Capabilities,
    batches: Mutex<Vec<T>>,
    fail: Mutex<Option<fn() -> ConsumeError>>,
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl<T: Batch> SinkConsumer<T> {
    /// A read-only sink.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::READ_ONLY)
    }

    /// A sink that declares it mutates data.
    pub fn mutating() -> Self {
        Self::with_capabilities(Capabilities::MUTATES)
    }

    fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            batches: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            starts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Makes every following consume fail with the error `fail` builds.
    pub fn fail_with(&self, fail: fn() -> ConsumeError) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = Some(fail);
    }

    /// Number of batches accepted so far.
    pub fn batch_count(&self) -> usize {
        self.batches().len()
    }

    /// Total items across the accepted batches.
    pub fn item_count(&self) -> usize {
        self.batches().iter().map(Batch::item_count).sum()
    }

    /// The accepted batches.
    pub fn batches(&self) -> MutexGuard<'_, Vec<T>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of start calls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of shutdown calls.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl<T: Batch> Default for SinkConsumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Batch> Consumer<T> for SinkConsumer<T> {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn consume(&self, _ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        if let Some(fail) = *self.fail.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(fail());
        }
        self.batches().push(batch);
        Ok(())
    }
}

#[async_trait]
impl<T: Batch> Component for SinkConsumer<T> {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A host with a fixed set of extensions.
#[derive(Default)]
pub struct StaticHost {
    extensions: BTreeMap<ComponentId, Arc<dyn Extension>>,
}

impl StaticHost {
    /// A host without extensions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extension under `id`.
    #[must_use]
    pub fn with_extension(mut self, id: ComponentId, extension: Arc<dyn Extension>) -> Self {
        self.extensions.insert(id, extension);
        self
    }
}

impl Host for StaticHost {
    fn extensions(&self) -> &BTreeMap<ComponentId, Arc<dyn Extension>> {
        &self.extensions
    }
}

/// An extension that provides nothing.
#[derive(Debug, Default)]
pub struct NopExtension;

#[async_trait]
impl Component for NopExtension {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl Extension for NopExtension {}

/// In-memory storage whose clients can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct FaultyStorage {
    inner: MemoryStorage,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

impl FaultyStorage {
    /// Storage that works until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every client batch fail, or succeed again.
    pub fn fail_batches(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Number of clients closed so far.
    pub fn closed_clients(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Component for FaultyStorage {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl Extension for FaultyStorage {
    fn as_storage(&self) -> Option<&dyn StorageExtension> {
        Some(self)
    }
}

#[async_trait]
impl StorageExtension for FaultyStorage {
    async fn get_client(
        &self,
        kind: Kind,
        owner: &ComponentId,
        name: &str,
    ) -> Result<Arc<dyn StorageClient>, StorageError> {
        let inner = self.inner.get_client(kind, owner, name).await?;
        Ok(Arc::new(FaultyClient {
            inner,
            failing: Arc::clone(&self.failing),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct FaultyClient {
    inner: Arc<dyn StorageClient>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl StorageClient for FaultyClient {
    async fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::backend("injected storage failure"));
        }
        self.inner.batch(ops).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

/// Shared, ordered log of lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    /// Appends an event.
    pub fn record(&self, event: impl Into<String>) {
        self.lock().push(event.into());
    }

    /// Every event so far, oldest first.
    pub fn events(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Events starting with `prefix`.
    pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// How many times `event` was recorded.
    pub fn count(&self, event: &str) -> usize {
        self.lock().iter().filter(|e| *e == event).count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A logs batch of one resource holding `records` log records.
pub fn logs_with_records(records: usize) -> Logs {
    Logs::new(ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(Resource::default()),
            scope_logs: vec![ScopeLogs {
                log_records: (0..records)
                    .map(|i| LogRecord {
                        time_unix_nano: i as u64,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    })
}

/// A traces batch of one resource holding `spans` spans.
pub fn traces_with_spans(spans: usize) -> Traces {
    Traces::new(ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource::default()),
            scope_spans: vec![ScopeSpans {
                spans: (0..spans)
                    .map(|i| Span {
                        name: format!("span-{i}"),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    })
}

/// A metrics batch with one gauge holding `points` data points.
pub fn metrics_with_points(points: usize) -> Metrics {
    Metrics::new(ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(Resource::default()),
            scope_metrics: vec![ScopeMetrics {
                metrics: vec![Metric {
                    name: "test.gauge".to_string(),
                    data: Some(metric::Data::Gauge(Gauge {
                        data_points: (0..points)
                            .map(|i| NumberDataPoint {
                                value: Some(number_data_point::Value::AsInt(i as i64)),
                                ..Default::default()
                            })
                            .collect(),
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    })
}
