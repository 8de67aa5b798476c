//! Component factories and the per-kind registries.
//!
//! A factory owns one component type. It supplies the default configuration
//! for that type and, for every signal it supports, a constructor and a
//! stability level. Constructors for unsupported signals keep their default
//! bodies, which report [`ComponentError::SignalNotSupported`].

use crate::component::{
    Component, ComponentId, ComponentType, CreateSettings, Extension, Kind, StabilityLevel,
};
use crate::consumer::{Consumer, DynConsumer};
use crate::error::{ComponentError, RegistryError};
use crate::pipeline::Signal;
use otel_agent_pdata::{Batch, Logs, Metrics, Traces};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A processor of one signal: a consumer with a lifecycle.
pub trait Processor<T: Batch>: Consumer<T> + Component {}
impl<T: Batch, P: Consumer<T> + Component + ?Sized> Processor<T> for P {}

/// An exporter of one signal.
pub trait Exporter<T: Batch>: Consumer<T> + Component {}
impl<T: Batch, E: Consumer<T> + Component + ?Sized> Exporter<T> for E {}

/// The exporting side of a connector, consuming batches of `T`.
pub trait Connector<T: Batch>: Consumer<T> + Component {}
impl<T: Batch, C: Consumer<T> + Component + ?Sized> Connector<T> for C {}

/// A running receiver.
pub type DynReceiver = Arc<dyn Component>;
/// A running processor of `T`.
pub type DynProcessor<T> = Arc<dyn Processor<T>>;
/// A running exporter of `T`.
pub type DynExporter<T> = Arc<dyn Exporter<T>>;
/// A running connector consuming `T`.
pub type DynConnector<T> = Arc<dyn Connector<T>>;

/// Configuration of one component instance.
///
/// Holds the user's table deep-merged over the factory's default config.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    id: ComponentId,
    value: Value,
}

impl ComponentConfig {
    /// Wraps an already merged configuration.
    pub fn new(id: ComponentId, value: Value) -> Self {
        Self { id, value }
    }

    /// Deep-merges `user` over `defaults`.
    ///
    /// Objects are merged key by key; any other value in `user` replaces the
    /// default. A missing or null user table keeps the defaults.
    pub fn merged(id: ComponentId, defaults: Value, user: Option<&Value>) -> Self {
        let mut value = defaults;
        if let Some(user) = user {
            merge_into(&mut value, user);
        }
        Self { id, value }
    }

    /// Returns the id of the configured instance.
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Returns the raw merged value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Deserializes the merged value into a typed config.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::InvalidConfig`] naming the instance id.
    pub fn parse<C: DeserializeOwned>(&self) -> Result<C, ComponentError> {
        C::deserialize(&self.value).map_err(|source| ComponentError::InvalidConfig {
            id: self.id.clone(),
            source,
        })
    }
}

fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Behaviour shared by the factories of every kind.
pub trait Factory: Send + Sync {
    /// Returns the type this factory builds.
    fn component_type(&self) -> ComponentType;

    /// Returns the configuration used when the user supplies none.
    fn create_default_config(&self) -> Value {
        Value::Object(Default::default())
    }
}

/// Builds receivers.
pub trait ReceiverFactory: Factory {
    /// Stability of the traces receiver.
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Stability of the metrics receiver.
    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Stability of the logs receiver.
    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Creates a traces receiver feeding `next`.
    fn create_traces(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
        _next: DynConsumer<Traces>,
    ) -> Result<DynReceiver, ComponentError> {
        Err(settings.signal_not_supported(Signal::Traces))
    }

    /// Creates a metrics receiver feeding `next`.
    fn create_metrics(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
        _next: DynConsumer<Metrics>,
    ) -> Result<DynReceiver, ComponentError> {
        Err(settings.signal_not_supported(Signal::Metrics))
    }

    /// Creates a logs receiver feeding `next`.
    fn create_logs(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
        _next: DynConsumer<Logs>,
    ) -> Result<DynReceiver, ComponentError> {
        Err(settings.signal_not_supported(Signal::Logs))
    }
}

/// Builds processors.
pub trait ProcessorFactory: Factory {
    /// Stability of the traces processor.
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Stability of the metrics processor.
    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Stability of the logs processor.
    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Creates a traces processor feeding `next`.
    fn create_traces(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
        _next: DynConsumer<Traces>,
    ) -> Result<DynProcessor<Traces>, ComponentError> {
        Err(settings.signal_not_supported(Signal::Traces))
    }

    /// Creates a metrics processor feeding `next`.
    fn create_metrics(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
        _next: DynConsumer<Metrics>,
    ) -> Result<DynProcessor<Metrics>, ComponentError> {
        Err(settings.signal_not_supported(Signal::Metrics))
    }

    /// Creates a logs processor feeding `next`.
    fn create_logs(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
        _next: DynConsumer<Logs>,
    ) -> Result<DynProcessor<Logs>, ComponentError> {
        Err(settings.signal_not_supported(Signal::Logs))
    }
}

/// Builds exporters.
pub trait ExporterFactory: Factory {
    /// Stability of the traces exporter.
    fn traces_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Stability of the metrics exporter.
    fn metrics_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Stability of the logs exporter.
    fn logs_stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Creates a traces exporter.
    fn create_traces(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
    ) -> Result<DynExporter<Traces>, ComponentError> {
        Err(settings.signal_not_supported(Signal::Traces))
    }

    /// Creates a metrics exporter.
    fn create_metrics(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
    ) -> Result<DynExporter<Metrics>, ComponentError> {
        Err(settings.signal_not_supported(Signal::Metrics))
    }

    /// Creates a logs exporter.
    fn create_logs(
        &self,
        settings: &CreateSettings,
        _config: &ComponentConfig,
    ) -> Result<DynExporter<Logs>, ComponentError> {
        Err(settings.signal_not_supported(Signal::Logs))
    }
}

fn connection_not_supported(settings: &CreateSettings, from: Signal, to: Signal) -> ComponentError {
    ComponentError::ConnectionNotSupported {
        id: settings.id.clone(),
        from,
        to,
    }
}

macro_rules! connector_constructor {
    ($(#[$doc:meta])* $name:ident, $from_ty:ty, $from:expr, $to_ty:ty, $to:expr) => {
        $(#[$doc])*
        fn $name(
            &self,
            settings: &CreateSettings,
            _config: &ComponentConfig,
            _next: DynConsumer<$to_ty>,
        ) -> Result<DynConnector<$from_ty>, ComponentError> {
            Err(connection_not_supported(settings, $from, $to))
        }
    };
}

/// Builds connectors.
///
/// A connector consumes batches of its source pipeline's signal and emits into
/// the pipelines of the destination signal.
pub trait ConnectorFactory: Factory {
    /// Stability of the connection from `from` to `to`.
    fn stability(&self, _from: Signal, _to: Signal) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    connector_constructor!(
        /// Creates a traces to traces connector.
        create_traces_to_traces, Traces, Signal::Traces, Traces, Signal::Traces
    );
    connector_constructor!(
        /// Creates a traces to metrics connector.
        create_traces_to_metrics, Traces, Signal::Traces, Metrics, Signal::Metrics
    );
    connector_constructor!(
        /// Creates a traces to logs connector.
        create_traces_to_logs, Traces, Signal::Traces, Logs, Signal::Logs
    );
    connector_constructor!(
        /// Creates a metrics to traces connector.
        create_metrics_to_traces, Metrics, Signal::Metrics, Traces, Signal::Traces
    );
    connector_constructor!(
        /// Creates a metrics to metrics connector.
        create_metrics_to_metrics, Metrics, Signal::Metrics, Metrics, Signal::Metrics
    );
    connector_constructor!(
        /// Creates a metrics to logs connector.
        create_metrics_to_logs, Metrics, Signal::Metrics, Logs, Signal::Logs
    );
    connector_constructor!(
        /// Creates a logs to traces connector.
        create_logs_to_traces, Logs, Signal::Logs, Traces, Signal::Traces
    );
    connector_constructor!(
        /// Creates a logs to metrics connector.
        create_logs_to_metrics, Logs, Signal::Logs, Metrics, Signal::Metrics
    );
    connector_constructor!(
        /// Creates a logs to logs connector.
        create_logs_to_logs, Logs, Signal::Logs, Logs, Signal::Logs
    );
}

/// Builds extensions.
pub trait ExtensionFactory: Factory {
    /// Stability of the extension.
    fn stability(&self) -> StabilityLevel {
        StabilityLevel::Undefined
    }

    /// Creates the extension.
    fn create(
        &self,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<Arc<dyn Extension>, ComponentError>;
}

/// Stability of `signal` for a receiver factory.
pub(crate) fn receiver_stability(factory: &dyn ReceiverFactory, signal: Signal) -> StabilityLevel {
    match signal {
        Signal::Traces => factory.traces_stability(),
        Signal::Metrics => factory.metrics_stability(),
        Signal::Logs => factory.logs_stability(),
        Signal::Profiles => StabilityLevel::Undefined,
    }
}

/// Stability of `signal` for a processor factory.
pub(crate) fn processor_stability(
    factory: &dyn ProcessorFactory,
    signal: Signal,
) -> StabilityLevel {
    match signal {
        Signal::Traces => factory.traces_stability(),
        Signal::Metrics => factory.metrics_stability(),
        Signal::Logs => factory.logs_stability(),
        Signal::Profiles => StabilityLevel::Undefined,
    }
}

/// Stability of `signal` for an exporter factory.
pub(crate) fn exporter_stability(factory: &dyn ExporterFactory, signal: Signal) -> StabilityLevel {
    match signal {
        Signal::Traces => factory.traces_stability(),
        Signal::Metrics => factory.metrics_stability(),
        Signal::Logs => factory.logs_stability(),
        Signal::Profiles => StabilityLevel::Undefined,
    }
}

/// Logs components whose stability warrants attention.
pub(crate) fn log_stability(kind: Kind, id: &ComponentId, level: StabilityLevel) {
    match level {
        StabilityLevel::Development => {
            tracing::warn!(%kind, component = %id, "component is in development and may change without notice");
        }
        StabilityLevel::Deprecated => {
            tracing::warn!(%kind, component = %id, "component is deprecated and will be removed in a future release");
        }
        StabilityLevel::Unmaintained => {
            tracing::warn!(%kind, component = %id, "component is unmaintained");
        }
        _ => {
            tracing::debug!(%kind, component = %id, stability = %level, "component stability");
        }
    }
}

/// Factories of one kind keyed by component type.
pub struct Registry<F: ?Sized> {
    kind: Kind,
    factories: BTreeMap<ComponentType, Arc<F>>,
}

impl<F: ?Sized + Factory> Registry<F> {
    /// Creates an empty registry for `kind`.
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    /// Adds a factory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateFactory`] if the type is taken.
    pub fn register(&mut self, factory: Arc<F>) -> Result<(), RegistryError> {
        let ty = factory.component_type();
        if self.factories.contains_key(&ty) {
            return Err(RegistryError::DuplicateFactory {
                kind: self.kind,
                ty,
            });
        }
        self.factories.insert(ty, factory);
        Ok(())
    }

    /// Looks up the factory for `ty`.
    pub fn get(&self, ty: &ComponentType) -> Option<&Arc<F>> {
        self.factories.get(ty)
    }

    /// Returns the registered types in order.
    pub fn types(&self) -> impl Iterator<Item = &ComponentType> {
        self.factories.keys()
    }

    /// Returns the kind of component this registry builds.
    pub fn kind(&self) -> Kind {
        self.kind
    }
}

impl<F: ?Sized> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One registry per component kind.
#[derive(Debug)]
pub struct Factories {
    /// Receiver factories.
    pub receivers: Registry<dyn ReceiverFactory>,
    /// Processor factories.
    pub processors: Registry<dyn ProcessorFactory>,
    /// Exporter factories.
    pub exporters: Registry<dyn ExporterFactory>,
    /// Connector factories.
    pub connectors: Registry<dyn ConnectorFactory>,
    /// Extension factories.
    pub extensions: Registry<dyn ExtensionFactory>,
}

impl Default for Factories {
    fn default() -> Self {
        Self::new()
    }
}

impl Factories {
    /// Creates empty registries.
    pub fn new() -> Self {
        Self {
            receivers: Registry::new(Kind::Receiver),
            processors: Registry::new(Kind::Processor),
            exporters: Registry::new(Kind::Exporter),
            connectors: Registry::new(Kind::Connector),
            extensions: Registry::new(Kind::Extension),
        }
    }

    /// Registers a receiver factory.
    pub fn with_receiver(mut self, f: Arc<dyn ReceiverFactory>) -> Result<Self, RegistryError> {
        self.receivers.register(f)?;
        Ok(self)
    }

    /// Registers a processor factory.
    pub fn with_processor(mut self, f: Arc<dyn ProcessorFactory>) -> Result<Self, RegistryError> {
        self.processors.register(f)?;
        Ok(self)
    }

    /// Registers an exporter factory.
    pub fn with_exporter(mut self, f: Arc<dyn ExporterFactory>) -> Result<Self, RegistryError> {
        self.exporters.register(f)?;
        Ok(self)
    }

    /// Registers a connector factory.
    pub fn with_connector(mut self, f: Arc<dyn ConnectorFactory>) -> Result<Self, RegistryError> {
        self.connectors.register(f)?;
        Ok(self)
    }

    /// Registers an extension factory.
    pub fn with_extension(mut self, f: Arc<dyn ExtensionFactory>) -> Result<Self, RegistryError> {
        self.extensions.register(f)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::BuildInfo;
    use serde::Deserialize;
    use serde_json::json;

    struct NoSignals;

    impl Factory for NoSignals {
        fn component_type(&self) -> ComponentType {
            ComponentType::new("nosignals").unwrap()
        }
    }

    impl ExporterFactory for NoSignals {}
    impl ConnectorFactory for NoSignals {}

    fn settings(kind: Kind) -> CreateSettings {
        CreateSettings::new("nosignals".parse().unwrap(), kind, BuildInfo::default())
    }

    #[test]
    fn test_deep_merge_keeps_unset_defaults() {
        let defaults = json!({
            "timeout": 5000,
            "retry": { "enabled": true, "max_elapsed": 300000 },
            "headers": { "a": "1" },
        });
        let user = json!({
            "retry": { "enabled": false },
            "headers": { "b": "2" },
        });
        let config = ComponentConfig::merged("x".parse().unwrap(), defaults, Some(&user));
        assert_eq!(
            config.value(),
            &json!({
                "timeout": 5000,
                "retry": { "enabled": false, "max_elapsed": 300000 },
                "headers": { "a": "1", "b": "2" },
            })
        );
    }

    #[test]
    fn test_null_user_config_keeps_defaults() {
        let config =
            ComponentConfig::merged("x".parse().unwrap(), json!({"a": 1}), Some(&Value::Null));
        assert_eq!(config.value(), &json!({"a": 1}));
    }

    #[test]
    fn test_parse_error_names_component() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Typed {
            size: u32,
        }

        let config = ComponentConfig::new("batch/fast".parse().unwrap(), json!({"size": "big"}));
        let err = config.parse::<Typed>().unwrap_err();
        assert!(err.to_string().contains("batch/fast"));
    }

    #[test]
    fn test_missing_constructor_is_signal_not_supported() {
        let settings = settings(Kind::Exporter);
        let config = ComponentConfig::new(settings.id.clone(), Value::Null);
        let err = NoSignals.create_logs(&settings, &config).err().unwrap();
        assert!(matches!(
            err,
            ComponentError::SignalNotSupported {
                signal: Signal::Logs,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_connection_is_reported() {
        let settings = settings(Kind::Connector);
        let config = ComponentConfig::new(settings.id.clone(), Value::Null);
        let next: DynConsumer<Metrics> = Arc::new(crate::testing::SinkConsumer::<Metrics>::new());
        let err = NoSignals
            .create_traces_to_metrics(&settings, &config, next)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ComponentError::ConnectionNotSupported {
                from: Signal::Traces,
                to: Signal::Metrics,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry: Registry<dyn ExporterFactory> = Registry::new(Kind::Exporter);
        registry.register(Arc::new(NoSignals)).unwrap();
        let err = registry.register(Arc::new(NoSignals)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateFactory {
                kind: Kind::Exporter,
                ty: ComponentType::new("nosignals").unwrap(),
            }
        );
    }
}
