//! Factories building recording components, used to test graph wiring.
//!
//! Every component accepts the same table:
//!
//! ```toml
//! mutates_data = false   # processors only
//! fail_start = false
//! fail_shutdown = false
//! ```

use super::{Recorder, SinkConsumer};
use crate::component::{Component, ComponentId, ComponentType, CreateSettings, Extension, Host, StabilityLevel};
use crate::consumer::{Capabilities, ConsumeError, Consumer, DynConsumer};
use crate::context::Context;
use crate::error::ComponentError;
use crate::factory::{
    ComponentConfig, ConnectorFactory, DynConnector, DynExporter, DynProcessor, DynReceiver,
    ExporterFactory, ExtensionFactory, Factories, Factory, ProcessorFactory, ReceiverFactory,
};
use crate::pipeline::Signal;
use crate::storage::MemoryStorageFactory;
use async_trait::async_trait;
use otel_agent_pdata::{Batch, Logs, Metrics, Traces};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TestConfig {
    mutates_data: bool,
    fail_start: bool,
    fail_shutdown: bool,
}

/// Lifecycle shared by every test component: records and optionally fails.
struct Recorded {
    label: String,
    recorder: Recorder,
    fail_start: bool,
    fail_shutdown: bool,
}

impl Recorded {
    fn new(
        settings: &CreateSettings,
        config: &ComponentConfig,
        recorder: &Recorder,
    ) -> Result<(Self, TestConfig), ComponentError> {
        let parsed: TestConfig = config.parse()?;
        let recorded = Self {
            label: format!("{} {}", settings.kind, settings.id),
            recorder: recorder.clone(),
            fail_start: parsed.fail_start,
            fail_shutdown: parsed.fail_shutdown,
        };
        Ok((recorded, parsed))
    }
}

#[async_trait]
impl Component for Recorded {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        self.recorder.record(format!("start {}", self.label));
        if self.fail_start {
            return Err(ComponentError::start(format!("{} refused to start", self.label)));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.recorder.record(format!("shutdown {}", self.label));
        if self.fail_shutdown {
            return Err(ComponentError::shutdown(format!(
                "{} refused to stop",
                self.label
            )));
        }
        Ok(())
    }
}

impl Extension for Recorded {}

type Slots<T> = Mutex<BTreeMap<ComponentId, T>>;

fn remember<T: Clone>(slots: &Slots<T>, id: &ComponentId, value: &T) {
    slots
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.clone(), value.clone());
}

fn lookup<T: Clone>(slots: &Slots<T>, id: &str) -> Option<T> {
    let id: ComponentId = id.parse().ok()?;
    slots
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned()
}

/// Builds `testrcv` receivers and keeps the consumer each one feeds.
#[derive(Default)]
pub struct TestReceiverFactory {
    recorder: Recorder,
    traces: Slots<DynConsumer<Traces>>,
    metrics: Slots<DynConsumer<Metrics>>,
    logs: Slots<DynConsumer<Logs>>,
}

impl TestReceiverFactory {
    /// A factory recording into `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            ..Self::default()
        }
    }

    /// The consumer the traces receiver `id` feeds.
    pub fn traces(&self, id: &str) -> Option<DynConsumer<Traces>> {
        lookup(&self.traces, id)
    }

    /// The consumer the metrics receiver `id` feeds.
    pub fn metrics(&self, id: &str) -> Option<DynConsumer<Metrics>> {
        lookup(&self.metrics, id)
    }

    /// The consumer the logs receiver `id` feeds.
    pub fn logs(&self, id: &str) -> Option<DynConsumer<Logs>> {
        lookup(&self.logs, id)
    }

    fn receiver(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynReceiver, ComponentError> {
        let (recorded, _) = Recorded::new(settings, config, &self.recorder)?;
        Ok(Arc::new(recorded))
    }
}

impl Factory for TestReceiverFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("testrcv")
    }
}

impl ReceiverFactory for TestReceiverFactory {
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
        remember(&self.traces, &settings.id, &next);
        self.receiver(settings, config)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynReceiver, ComponentError> {
        remember(&self.metrics, &settings.id, &next);
        self.receiver(settings, config)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Logs>,
    ) -> Result<DynReceiver, ComponentError> {
        remember(&self.logs, &settings.id, &next);
        self.receiver(settings, config)
    }
}

/// A processor forwarding every batch unchanged.
struct PassThrough<T: Batch> {
    recorded: Recorded,
    capabilities: Capabilities,
    next: DynConsumer<T>,
}

#[async_trait]
impl<T: Batch> Consumer<T> for PassThrough<T> {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        self.next.consume(ctx, batch).await
    }
}

#[async_trait]
impl<T: Batch> Component for PassThrough<T> {
    async fn start(&self, host: &dyn Host) -> Result<(), ComponentError> {
        self.recorded.start(host).await
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.recorded.shutdown().await
    }
}

/// Builds `testproc` processors.
#[derive(Default)]
pub struct TestProcessorFactory {
    recorder: Recorder,
}

impl TestProcessorFactory {
    /// A factory recording into `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }

    fn processor<T: Batch>(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<T>,
    ) -> Result<DynProcessor<T>, ComponentError> {
        let (recorded, parsed) = Recorded::new(settings, config, &self.recorder)?;
        Ok(Arc::new(PassThrough {
            recorded,
            capabilities: Capabilities {
                mutates_data: parsed.mutates_data,
            },
            next,
        }))
    }
}

impl Factory for TestProcessorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("testproc")
    }
}

impl ProcessorFactory for TestProcessorFactory {
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
    ) -> Result<DynProcessor<Traces>, ComponentError> {
        self.processor(settings, config, next)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynProcessor<Metrics>, ComponentError> {
        self.processor(settings, config, next)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Logs>,
    ) -> Result<DynProcessor<Logs>, ComponentError> {
        self.processor(settings, config, next)
    }
}

/// An exporter storing batches in a sink.
struct SinkExporter<T: Batch> {
    recorded: Recorded,
    sink: Arc<SinkConsumer<T>>,
}

#[async_trait]
impl<T: Batch> Consumer<T> for SinkExporter<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        self.sink.consume(ctx, batch).await
    }
}

#[async_trait]
impl<T: Batch> Component for SinkExporter<T> {
    async fn start(&self, host: &dyn Host) -> Result<(), ComponentError> {
        self.sink.start(host).await?;
        self.recorded.start(host).await
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.sink.shutdown().await?;
        self.recorded.shutdown().await
    }
}

/// Builds `testexp` exporters and keeps the sink behind each one.
#[derive(Default)]
pub struct TestExporterFactory {
    recorder: Recorder,
    traces: Slots<Arc<SinkConsumer<Traces>>>,
    metrics: Slots<Arc<SinkConsumer<Metrics>>>,
    logs: Slots<Arc<SinkConsumer<Logs>>>,
}

impl TestExporterFactory {
    /// A factory recording into `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            ..Self::default()
        }
    }

    /// The sink of the traces exporter `id`.
    pub fn traces(&self, id: &str) -> Option<Arc<SinkConsumer<Traces>>> {
        lookup(&self.traces, id)
    }

    /// The sink of the metrics exporter `id`.
    pub fn metrics(&self, id: &str) -> Option<Arc<SinkConsumer<Metrics>>> {
        lookup(&self.metrics, id)
    }

    /// The sink of the logs exporter `id`.
    pub fn logs(&self, id: &str) -> Option<Arc<SinkConsumer<Logs>>> {
        lookup(&self.logs, id)
    }

    fn exporter<T: Batch>(
        &self,
        slots: &Slots<Arc<SinkConsumer<T>>>,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<T>, ComponentError> {
        let (recorded, _) = Recorded::new(settings, config, &self.recorder)?;
        let sink = Arc::new(SinkConsumer::new());
        remember(slots, &settings.id, &sink);
        Ok(Arc::new(SinkExporter { recorded, sink }))
    }
}

impl Factory for TestExporterFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("testexp")
    }
}

impl ExporterFactory for TestExporterFactory {
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
    ) -> Result<DynExporter<Traces>, ComponentError> {
        self.exporter(&self.traces, settings, config)
    }

    fn create_metrics(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<Metrics>, ComponentError> {
        self.exporter(&self.metrics, settings, config)
    }

    fn create_logs(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<Logs>, ComponentError> {
        self.exporter(&self.logs, settings, config)
    }
}

/// A connector converting every batch with a plain function.
struct Converting<F: Batch, T: Batch> {
    recorded: Recorded,
    convert: fn(F) -> T,
    next: DynConsumer<T>,
}

#[async_trait]
impl<F: Batch, T: Batch> Consumer<F> for Converting<F, T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn consume(&self, ctx: &Context, batch: F) -> Result<(), ConsumeError> {
        self.next.consume(ctx, (self.convert)(batch)).await
    }
}

#[async_trait]
impl<F: Batch, T: Batch> Component for Converting<F, T> {
    async fn start(&self, host: &dyn Host) -> Result<(), ComponentError> {
        self.recorded.start(host).await
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        self.recorded.shutdown().await
    }
}

/// Builds `testconn` connectors for every signal pair.
///
/// Same-signal connections forward the batch; cross-signal ones emit an empty
/// batch of the destination signal for every batch consumed.
#[derive(Default)]
pub struct TestConnectorFactory {
    recorder: Recorder,
}

impl TestConnectorFactory {
    /// A factory recording into `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }

    fn connector<F: Batch, T: Batch>(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<T>,
        convert: fn(F) -> T,
    ) -> Result<DynConnector<F>, ComponentError> {
        let (recorded, _) = Recorded::new(settings, config, &self.recorder)?;
        Ok(Arc::new(Converting {
            recorded,
            convert,
            next,
        }))
    }
}

fn forward<B>(batch: B) -> B {
    batch
}

fn empty<F, T: Default>(_batch: F) -> T {
    T::default()
}

macro_rules! test_connection {
    ($name:ident, $from:ty, $to:ty, $convert:expr) => {
        fn $name(
            &self,
            settings: &CreateSettings,
            config: &ComponentConfig,
            next: DynConsumer<$to>,
        ) -> Result<DynConnector<$from>, ComponentError> {
            self.connector::<$from, $to>(settings, config, next, $convert)
        }
    };
}

impl Factory for TestConnectorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("testconn")
    }
}

impl ConnectorFactory for TestConnectorFactory {
    fn stability(&self, from: Signal, to: Signal) -> StabilityLevel {
        if from == Signal::Profiles || to == Signal::Profiles {
            StabilityLevel::Undefined
        } else {
            StabilityLevel::Development
        }
    }

    test_connection!(create_traces_to_traces, Traces, Traces, forward);
    test_connection!(create_traces_to_metrics, Traces, Metrics, empty);
    test_connection!(create_traces_to_logs, Traces, Logs, empty);
    test_connection!(create_metrics_to_traces, Metrics, Traces, empty);
    test_connection!(create_metrics_to_metrics, Metrics, Metrics, forward);
    test_connection!(create_metrics_to_logs, Metrics, Logs, empty);
    test_connection!(create_logs_to_traces, Logs, Traces, empty);
    test_connection!(create_logs_to_metrics, Logs, Metrics, empty);
    test_connection!(create_logs_to_logs, Logs, Logs, forward);
}

/// Builds `testext` extensions.
#[derive(Default)]
pub struct TestExtensionFactory {
    recorder: Recorder,
}

impl TestExtensionFactory {
    /// A factory recording into `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl Factory for TestExtensionFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("testext")
    }
}

impl ExtensionFactory for TestExtensionFactory {
    fn stability(&self) -> StabilityLevel {
        StabilityLevel::Beta
    }

    fn create(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<Arc<dyn Extension>, ComponentError> {
        let (recorded, _) = Recorded::new(settings, config, &self.recorder)?;
        Ok(Arc::new(recorded))
    }
}

/// One of each test factory, sharing a recorder.
pub struct TestFactories {
    /// Lifecycle events of every component built.
    pub recorder: Recorder,
    /// The `testrcv` factory.
    pub receivers: Arc<TestReceiverFactory>,
    /// The `testproc` factory.
    pub processors: Arc<TestProcessorFactory>,
    /// The `testexp` factory.
    pub exporters: Arc<TestExporterFactory>,
    /// The `testconn` factory.
    pub connectors: Arc<TestConnectorFactory>,
    /// The `testext` factory.
    pub extensions: Arc<TestExtensionFactory>,
    storage: Arc<MemoryStorageFactory>,
}

impl TestFactories {
    /// Creates the factories, all recording into `recorder`.
    pub fn new(recorder: Recorder) -> Self {
        Self {
            receivers: Arc::new(TestReceiverFactory::new(recorder.clone())),
            processors: Arc::new(TestProcessorFactory::new(recorder.clone())),
            exporters: Arc::new(TestExporterFactory::new(recorder.clone())),
            connectors: Arc::new(TestConnectorFactory::new(recorder.clone())),
            extensions: Arc::new(TestExtensionFactory::new(recorder.clone())),
            storage: Arc::new(MemoryStorageFactory::new()),
            recorder,
        }
    }

    /// A registry holding the test factories and `memory_storage`.
    pub fn factories(&self) -> Factories {
        let mut factories = Factories::new();
        let registered = factories
            .receivers
            .register(self.receivers.clone())
            .and(factories.processors.register(self.processors.clone()))
            .and(factories.exporters.register(self.exporters.clone()))
            .and(factories.connectors.register(self.connectors.clone()))
            .and(factories.extensions.register(self.extensions.clone()))
            .and(factories.extensions.register(self.storage.clone()));
        if let Err(e) = registered {
            panic!("test factories collide: {e}");
        }
        factories
    }
}
