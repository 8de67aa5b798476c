//! The running service: extensions plus the pipeline graph.

use crate::component::{BuildInfo, Component, ComponentId, CreateSettings, Extension, Host, Kind};
use crate::config::ServiceConfig;
use crate::error::GraphError;
use crate::factory::{ComponentConfig, Factories, log_stability};
use crate::graph::{Graph, Settings};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extensions and pipelines built from one configuration.
///
/// Extensions start before any pipeline component and stop after all of
/// them, so queues and receivers can rely on them for their whole lifetime.
pub struct Service {
    build_info: BuildInfo,
    extensions: BTreeMap<ComponentId, Arc<dyn Extension>>,
    extension_order: Vec<ComponentId>,
    graph: Graph,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("build_info", &self.build_info)
            .field("extensions", &self.extension_order)
            .field("graph", &self.graph)
            .finish()
    }
}

impl Service {
    /// Validates `config`, builds the enabled extensions, then the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] naming the first unresolvable reference or
    /// failing factory.
    pub fn new(
        build_info: BuildInfo,
        config: &ServiceConfig,
        factories: &Factories,
    ) -> Result<Self, GraphError> {
        let mut extensions = BTreeMap::new();
        for id in &config.service.extensions {
            let Some(user) = config.extensions.get(id) else {
                return Err(GraphError::NotConfigured {
                    location: "service".to_string(),
                    kind: Kind::Extension,
                    id: id.clone(),
                });
            };
            let factory = factories.extensions.get(id.component_type()).ok_or_else(|| {
                GraphError::FactoryNotFound {
                    kind: Kind::Extension,
                    id: id.clone(),
                }
            })?;
            let settings = CreateSettings::new(id.clone(), Kind::Extension, build_info.clone());
            let component_config =
                ComponentConfig::merged(id.clone(), factory.create_default_config(), Some(user));
            log_stability(Kind::Extension, id, factory.stability());
            let extension = factory
                .create(&settings, &component_config)
                .map_err(|source| GraphError::Create {
                    node: extension_label(id),
                    source,
                })?;
            extensions.insert(id.clone(), extension);
        }

        let graph = Graph::build(Settings {
            build_info: &build_info,
            config,
            factories,
        })?;

        Ok(Self {
            build_info,
            extensions,
            extension_order: config.service.extensions.clone(),
            graph,
        })
    }

    /// Starts extensions in configuration order, then the pipelines.
    ///
    /// A failure shuts down everything already started before returning.
    pub async fn start(&self) -> Result<(), GraphError> {
        tracing::info!(
            version = %self.build_info.version,
            extensions = self.extension_order.len(),
            "starting service"
        );
        let mut started = Vec::new();
        for id in &self.extension_order {
            let Some(extension) = self.extensions.get(id) else {
                continue;
            };
            tracing::debug!(extension = %id, "starting");
            if let Err(source) = extension.start(self).await {
                started.push(id.clone());
                self.shutdown_extensions(&started).await;
                return Err(GraphError::Start {
                    node: extension_label(id),
                    source,
                });
            }
            started.push(id.clone());
        }

        if let Err(e) = self.graph.start(self).await {
            self.shutdown_extensions(&started).await;
            return Err(e);
        }
        tracing::info!("everything is ready, begin running and processing data");
        Ok(())
    }

    /// Stops the pipelines, then the extensions in reverse order.
    ///
    /// Every component is asked to stop; failures are joined.
    pub async fn shutdown(&self) -> Result<(), GraphError> {
        tracing::info!("starting shutdown");
        let mut errors = Vec::new();
        if let Err(e) = self.graph.shutdown().await {
            errors.push(e);
        }
        for id in self.extension_order.iter().rev() {
            let Some(extension) = self.extensions.get(id) else {
                continue;
            };
            if let Err(source) = extension.shutdown().await {
                errors.push(GraphError::Shutdown {
                    node: extension_label(id),
                    source,
                });
            }
        }
        let result = GraphError::join(errors);
        match &result {
            Ok(()) => tracing::info!("shutdown complete"),
            Err(e) => tracing::warn!(error = %e, "shutdown completed with errors"),
        }
        result
    }

    /// The host handed to components.
    pub fn host(&self) -> &dyn Host {
        self
    }

    /// The pipeline graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Everything [`Service::start`] starts, in order.
    pub fn start_order(&self) -> Vec<String> {
        self.extension_order
            .iter()
            .map(extension_label)
            .chain(self.graph.start_order().into_iter().map(ToString::to_string))
            .collect()
    }

    async fn shutdown_extensions(&self, started: &[ComponentId]) {
        for id in started.iter().rev() {
            if let Some(extension) = self.extensions.get(id)
                && let Err(e) = extension.shutdown().await
            {
                tracing::warn!(extension = %id, error = %e, "shutdown after failed start");
            }
        }
    }
}

impl Host for Service {
    fn extensions(&self) -> &BTreeMap<ComponentId, Arc<dyn Extension>> {
        &self.extensions
    }
}

fn extension_label(id: &ComponentId) -> String {
    format!("extension \"{id}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, ServiceSection};
    use crate::testing::{Recorder, TestFactories};
    use serde_json::{Value, json};

    fn config(extensions: &[&str]) -> ServiceConfig {
        let table = |ids: &[&str]| -> BTreeMap<ComponentId, Value> {
            ids.iter()
                .map(|id| (id.parse().unwrap(), Value::Null))
                .collect()
        };
        ServiceConfig {
            receivers: table(&["testrcv"]),
            processors: table(&["testproc"]),
            exporters: table(&["testexp"]),
            connectors: BTreeMap::new(),
            extensions: table(&["testext", "testext/second", "memory_storage"]),
            service: ServiceSection {
                extensions: extensions.iter().map(|id| id.parse().unwrap()).collect(),
                pipelines: BTreeMap::from([(
                    "logs".to_string(),
                    PipelineConfig::from_ids(&["testrcv"], &["testproc"], &["testexp"]),
                )]),
            },
        }
    }

    #[tokio::test]
    async fn test_extensions_wrap_the_pipelines() {
        let recorder = Recorder::default();
        let test = TestFactories::new(recorder.clone());
        let service = Service::new(
            BuildInfo::default(),
            &config(&["testext/second", "testext"]),
            &test.factories(),
        )
        .unwrap();

        service.start().await.unwrap();
        service.shutdown().await.unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                "start extension testext/second",
                "start extension testext",
                "start exporter testexp",
                "start processor testproc",
                "start receiver testrcv",
                "shutdown receiver testrcv",
                "shutdown processor testproc",
                "shutdown exporter testexp",
                "shutdown extension testext",
                "shutdown extension testext/second",
            ]
        );
    }

    #[test]
    fn test_start_order_lists_extensions_first() {
        let test = TestFactories::new(Recorder::default());
        let service =
            Service::new(BuildInfo::default(), &config(&["testext"]), &test.factories()).unwrap();
        let order = service.start_order();
        assert_eq!(order[0], "extension \"testext\"");
        assert!(order[1].starts_with("exporter \"testexp\""));
        assert!(order.last().unwrap().starts_with("receiver \"testrcv\""));
    }

    #[test]
    fn test_unconfigured_extension_is_rejected() {
        let test = TestFactories::new(Recorder::default());
        let err = Service::new(BuildInfo::default(), &config(&["testext/missing"]), &test.factories())
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::NotConfigured {
                kind: Kind::Extension,
                ..
            }
        ));
        assert!(err.to_string().starts_with("service references extension"));
    }

    #[test]
    fn test_extension_without_factory_is_rejected() {
        let test = TestFactories::new(Recorder::default());
        let mut config = config(&["zpages"]);
        config.extensions.insert("zpages".parse().unwrap(), json!({}));
        let err = Service::new(BuildInfo::default(), &config, &test.factories()).unwrap_err();
        assert!(matches!(
            err,
            GraphError::FactoryNotFound {
                kind: Kind::Extension,
                ..
            }
        ));
    }

    #[test]
    fn test_host_exposes_enabled_extensions_only() {
        let test = TestFactories::new(Recorder::default());
        let service = Service::new(
            BuildInfo::default(),
            &config(&["memory_storage"]),
            &test.factories(),
        )
        .unwrap();
        let extensions = service.host().extensions();
        assert_eq!(extensions.len(), 1);
        let storage = &extensions[&"memory_storage".parse::<ComponentId>().unwrap()];
        assert!(storage.as_storage().is_some());
    }

    #[tokio::test]
    async fn test_failed_extension_start_stops_earlier_extensions() {
        let recorder = Recorder::default();
        let test = TestFactories::new(recorder.clone());
        let mut config = config(&["testext", "testext/second"]);
        config.extensions.insert(
            "testext/second".parse().unwrap(),
            json!({ "fail_start": true }),
        );
        let service = Service::new(BuildInfo::default(), &config, &test.factories()).unwrap();

        let err = service.start().await.unwrap_err();
        assert!(err.to_string().contains("testext/second"));
        assert_eq!(
            recorder.events(),
            vec![
                "start extension testext",
                "start extension testext/second",
                "shutdown extension testext/second",
                "shutdown extension testext",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_pipeline_start_stops_failed_component_and_extensions() {
        let recorder = Recorder::default();
        let test = TestFactories::new(recorder.clone());
        let mut config = config(&["testext"]);
        config
            .exporters
            .insert("testexp".parse().unwrap(), json!({ "fail_start": true }));
        let service = Service::new(BuildInfo::default(), &config, &test.factories()).unwrap();

        assert!(service.start().await.is_err());
        assert_eq!(
            recorder.events(),
            vec![
                "start extension testext",
                "start exporter testexp",
                "shutdown exporter testexp",
                "shutdown extension testext",
            ]
        );
    }
}
