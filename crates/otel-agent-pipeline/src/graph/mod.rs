//! Builds the pipeline graph from the service configuration and drives its
//! lifecycle.
//!
//! Building happens in four steps:
//!
//! 1. every pipeline and every reference it makes is validated;
//! 2. one node is created per component instance plus a head and a fan-out
//!    per pipeline, and the nodes are wired in data-flow order;
//! 3. the nodes are sorted topologically, which rejects any cycle;
//! 4. components are instantiated from the exporters upwards so that every
//!    factory receives an already built downstream consumer.
//!
//! Components start in reverse topological order, exporters first, and stop
//! in topological order, receivers first.

mod node;

pub use node::NodeId;

use crate::component::{BuildInfo, Component, ComponentId, CreateSettings, Host, Kind};
use crate::config::{PipelineConfig, ServiceConfig};
use crate::consumer::{Capabilities, CapabilitiesConsumer, DynConsumer};
use crate::error::{ComponentError, GraphError, IdError};
use crate::factory::{
    ComponentConfig, Factories, exporter_stability, log_stability, processor_stability,
    receiver_stability,
};
use crate::fanout::new_fanout;
use crate::pipeline::{PipelineId, Signal};
use node::{AnyConsumer, SignalType};
use otel_agent_pdata::{Logs, Metrics, Traces};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Inputs of [`Graph::build`].
#[derive(Debug, Clone, Copy)]
pub struct Settings<'a> {
    /// Build information handed to every component.
    pub build_info: &'a BuildInfo,
    /// The service configuration.
    pub config: &'a ServiceConfig,
    /// Registered factories.
    pub factories: &'a Factories,
}

/// A built pipeline graph.
pub struct Graph {
    successors: BTreeMap<NodeId, Vec<NodeId>>,
    processors: BTreeMap<PipelineId, Vec<NodeId>>,
    order: Vec<NodeId>,
    consumers: BTreeMap<NodeId, AnyConsumer>,
    components: BTreeMap<NodeId, Arc<dyn Component>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Validates the configuration and instantiates every component.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure, a [`GraphError::Cycle`], or the
    /// first factory failure.
    pub fn build(settings: Settings<'_>) -> Result<Self, GraphError> {
        let pipelines = parse_pipelines(settings.config)?;
        for (id, pipeline) in &pipelines {
            validate_pipeline(id, pipeline, settings)?;
        }
        validate_connectors(&pipelines, settings)?;

        let mut graph = Graph {
            successors: BTreeMap::new(),
            processors: BTreeMap::new(),
            order: Vec::new(),
            consumers: BTreeMap::new(),
            components: BTreeMap::new(),
        };
        graph.create_nodes(&pipelines, settings);
        graph.order = graph.topological_order()?;

        let reversed: Vec<NodeId> = graph.order.iter().rev().cloned().collect();
        for node in &reversed {
            graph.build_node(node, settings)?;
        }
        tracing::debug!(nodes = graph.order.len(), "pipeline graph built");
        Ok(graph)
    }

    /// Starts every component, exporters first.
    ///
    /// On failure the failing component and the ones already started are
    /// shut down in reverse order before the error is returned; a partial
    /// start may hold resources that only shutdown releases.
    pub async fn start(&self, host: &dyn Host) -> Result<(), GraphError> {
        let mut started: Vec<(&NodeId, &Arc<dyn Component>)> = Vec::new();
        for (node, component) in self.start_order_with_components() {
            tracing::debug!(%node, "starting");
            if let Err(source) = component.start(host).await {
                started.push((node, component));
                for (started_node, started_component) in started.iter().rev() {
                    if let Err(e) = started_component.shutdown().await {
                        tracing::warn!(node = %started_node, error = %e, "shutdown after failed start");
                    }
                }
                return Err(GraphError::Start {
                    node: node.to_string(),
                    source,
                });
            }
            started.push((node, component));
        }
        Ok(())
    }

    /// Shuts every component down, receivers first.
    ///
    /// Every component is asked to stop even when an earlier one fails; the
    /// failures are joined.
    pub async fn shutdown(&self) -> Result<(), GraphError> {
        let mut errors = Vec::new();
        for node in &self.order {
            let Some(component) = self.components.get(node) else {
                continue;
            };
            tracing::debug!(%node, "shutting down");
            if let Err(source) = component.shutdown().await {
                errors.push(GraphError::Shutdown {
                    node: node.to_string(),
                    source,
                });
            }
        }
        GraphError::join(errors)
    }

    /// Component nodes in the order [`Graph::start`] visits them.
    pub fn start_order(&self) -> Vec<&NodeId> {
        self.start_order_with_components()
            .map(|(node, _)| node)
            .collect()
    }

    /// Component nodes in the order [`Graph::shutdown`] visits them.
    pub fn shutdown_order(&self) -> Vec<&NodeId> {
        self.order
            .iter()
            .filter(|node| self.components.contains_key(*node))
            .collect()
    }

    /// Every node, topologically sorted.
    pub fn nodes(&self) -> &[NodeId] {
        &self.order
    }

    /// Exporters by signal and id.
    pub fn exporters(&self) -> BTreeMap<Signal, BTreeMap<ComponentId, Arc<dyn Component>>> {
        let mut exporters: BTreeMap<Signal, BTreeMap<ComponentId, Arc<dyn Component>>> =
            BTreeMap::new();
        for (node, component) in &self.components {
            if let NodeId::Exporter { id, signal } = node {
                exporters
                    .entry(*signal)
                    .or_default()
                    .insert(id.clone(), Arc::clone(component));
            }
        }
        exporters
    }

    /// Capabilities advertised at the head of `pipeline`.
    pub fn capabilities(&self, pipeline: &PipelineId) -> Option<Capabilities> {
        let head = NodeId::Capabilities {
            pipeline: pipeline.clone(),
        };
        self.consumers.get(&head).map(|c| Capabilities {
            mutates_data: c.mutates_data(),
        })
    }

    fn start_order_with_components(&self) -> impl Iterator<Item = (&NodeId, &Arc<dyn Component>)> {
        self.order
            .iter()
            .rev()
            .filter_map(|node| self.components.get(node).map(|c| (node, c)))
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        self.successors.entry(to.clone()).or_default();
        let next = self.successors.entry(from).or_default();
        if !next.contains(&to) {
            next.push(to);
        }
    }

    fn create_nodes(
        &mut self,
        pipelines: &BTreeMap<PipelineId, &PipelineConfig>,
        settings: Settings<'_>,
    ) {
        let connectors = &settings.config.connectors;
        for (pipeline_id, pipeline) in pipelines {
            let head = NodeId::Capabilities {
                pipeline: pipeline_id.clone(),
            };
            let fanout = NodeId::FanOut {
                pipeline: pipeline_id.clone(),
            };
            let signal = pipeline_id.signal();

            for id in &pipeline.receivers {
                if connectors.contains_key(id) {
                    for (source_id, source) in pipelines {
                        if source.exporters.contains(id)
                            && connects(settings, id, source_id.signal(), signal)
                        {
                            let connector = NodeId::Connector {
                                id: id.clone(),
                                from: source_id.signal(),
                                to: signal,
                            };
                            self.add_edge(connector, head.clone());
                        }
                    }
                } else {
                    let receiver = NodeId::Receiver {
                        id: id.clone(),
                        signal,
                    };
                    self.add_edge(receiver, head.clone());
                }
            }

            let mut previous = head;
            let mut chain = Vec::with_capacity(pipeline.processors.len());
            for id in &pipeline.processors {
                let processor = NodeId::Processor {
                    pipeline: pipeline_id.clone(),
                    id: id.clone(),
                };
                self.add_edge(previous, processor.clone());
                chain.push(processor.clone());
                previous = processor;
            }
            self.processors.insert(pipeline_id.clone(), chain);
            self.add_edge(previous, fanout.clone());

            for id in &pipeline.exporters {
                if connectors.contains_key(id) {
                    for (target_id, target) in pipelines {
                        if target.receivers.contains(id)
                            && connects(settings, id, signal, target_id.signal())
                        {
                            let connector = NodeId::Connector {
                                id: id.clone(),
                                from: signal,
                                to: target_id.signal(),
                            };
                            self.add_edge(fanout.clone(), connector);
                        }
                    }
                } else {
                    let exporter = NodeId::Exporter {
                        id: id.clone(),
                        signal,
                    };
                    self.add_edge(fanout.clone(), exporter);
                }
            }
        }
    }

    /// Kahn's algorithm with the ready set ordered by node id.
    fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: BTreeMap<&NodeId, usize> =
            self.successors.keys().map(|node| (node, 0)).collect();
        for next in self.successors.values().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree += 1;
            }
        }

        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.successors.len());
        while let Some(node) = ready.pop_first() {
            order.push(node.clone());
            for next in self.successors.get(node).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(next);
                    }
                }
            }
        }

        if order.len() < self.successors.len() {
            return Err(GraphError::Cycle(self.find_cycle(&order)));
        }
        Ok(order)
    }

    fn find_cycle(&self, sorted: &[NodeId]) -> Vec<String> {
        let done: BTreeSet<&NodeId> = sorted.iter().collect();
        let mut visited = BTreeSet::new();
        for start in self.successors.keys().filter(|node| !done.contains(node)) {
            let mut path = Vec::new();
            if let Some(cycle) = self.walk_cycle(start, &done, &mut visited, &mut path) {
                return cycle;
            }
        }
        Vec::new()
    }

    fn walk_cycle<'a>(
        &'a self,
        node: &'a NodeId,
        done: &BTreeSet<&NodeId>,
        visited: &mut BTreeSet<&'a NodeId>,
        path: &mut Vec<&'a NodeId>,
    ) -> Option<Vec<String>> {
        if let Some(position) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[position..].iter().map(ToString::to_string).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }
        path.push(node);
        for next in self.successors.get(node).into_iter().flatten() {
            if done.contains(next) {
                continue;
            }
            if let Some(cycle) = self.walk_cycle(next, done, visited, path) {
                return Some(cycle);
            }
        }
        path.pop();
        None
    }

    fn build_node(&mut self, node: &NodeId, settings: Settings<'_>) -> Result<(), GraphError> {
        match node.signal() {
            Signal::Traces => self.build_typed::<Traces>(node, settings),
            Signal::Metrics => self.build_typed::<Metrics>(node, settings),
            Signal::Logs => self.build_typed::<Logs>(node, settings),
            Signal::Profiles => match (node.kind(), node.component_id()) {
                (Some(kind), Some(id)) => Err(create_error(
                    node,
                    ComponentError::SignalNotSupported {
                        kind,
                        id: id.clone(),
                        signal: Signal::Profiles,
                    },
                )),
                // Component nodes downstream of a profiles head fail first.
                _ => Ok(()),
            },
        }
    }

    fn build_typed<T: SignalType>(
        &mut self,
        node: &NodeId,
        settings: Settings<'_>,
    ) -> Result<(), GraphError> {
        let factories = settings.factories;
        match node {
            NodeId::Exporter { id, .. } => {
                let factory = factories
                    .exporters
                    .get(id.component_type())
                    .ok_or_else(|| factory_not_found(Kind::Exporter, id))?;
                let create = create_settings(id, Kind::Exporter, settings);
                let config = component_config(
                    id,
                    factory.create_default_config(),
                    settings.config.exporters.get(id),
                );
                log_stability(Kind::Exporter, id, exporter_stability(factory.as_ref(), T::KIND));
                let exporter = T::create_exporter(factory.as_ref(), &create, &config)
                    .map_err(|source| create_error(node, source))?;
                let component: Arc<dyn Component> = exporter.clone();
                self.components.insert(node.clone(), component);
                self.consumers.insert(node.clone(), T::wrap(exporter));
            }
            NodeId::FanOut { .. } => {
                let fanout = new_fanout(self.next_consumers::<T>(node))?;
                self.consumers.insert(node.clone(), T::wrap(fanout));
            }
            NodeId::Processor { id, .. } => {
                let factory = factories
                    .processors
                    .get(id.component_type())
                    .ok_or_else(|| factory_not_found(Kind::Processor, id))?;
                let next = self.single_next::<T>(node)?;
                let create = create_settings(id, Kind::Processor, settings);
                let config = component_config(
                    id,
                    factory.create_default_config(),
                    settings.config.processors.get(id),
                );
                log_stability(Kind::Processor, id, processor_stability(factory.as_ref(), T::KIND));
                let processor = T::create_processor(factory.as_ref(), &create, &config, next)
                    .map_err(|source| create_error(node, source))?;
                let component: Arc<dyn Component> = processor.clone();
                self.components.insert(node.clone(), component);
                self.consumers.insert(node.clone(), T::wrap(processor));
            }
            NodeId::Capabilities { pipeline } => {
                let next = self.single_next::<T>(node)?;
                let mutates_data = self
                    .processors
                    .get(pipeline)
                    .into_iter()
                    .flatten()
                    .filter_map(|processor| self.consumers.get(processor))
                    .any(AnyConsumer::mutates_data);
                let head: DynConsumer<T> =
                    Arc::new(CapabilitiesConsumer::new(next, Capabilities { mutates_data }));
                self.consumers.insert(node.clone(), T::wrap(head));
            }
            NodeId::Receiver { id, .. } => {
                let factory = factories
                    .receivers
                    .get(id.component_type())
                    .ok_or_else(|| factory_not_found(Kind::Receiver, id))?;
                let next = new_fanout(self.next_consumers::<T>(node))?;
                let create = create_settings(id, Kind::Receiver, settings);
                let config = component_config(
                    id,
                    factory.create_default_config(),
                    settings.config.receivers.get(id),
                );
                log_stability(Kind::Receiver, id, receiver_stability(factory.as_ref(), T::KIND));
                let receiver = T::create_receiver(factory.as_ref(), &create, &config, next)
                    .map_err(|source| create_error(node, source))?;
                self.components.insert(node.clone(), receiver);
            }
            NodeId::Connector { id, to, .. } => {
                let factory = factories
                    .connectors
                    .get(id.component_type())
                    .ok_or_else(|| factory_not_found(Kind::Connector, id))?;
                let next = match to {
                    Signal::Traces => Traces::wrap(new_fanout(self.next_consumers::<Traces>(node))?),
                    Signal::Metrics => {
                        Metrics::wrap(new_fanout(self.next_consumers::<Metrics>(node))?)
                    }
                    Signal::Logs => Logs::wrap(new_fanout(self.next_consumers::<Logs>(node))?),
                    Signal::Profiles => {
                        return Err(create_error(
                            node,
                            ComponentError::ConnectionNotSupported {
                                id: id.clone(),
                                from: T::KIND,
                                to: Signal::Profiles,
                            },
                        ));
                    }
                };
                let create = create_settings(id, Kind::Connector, settings);
                let config = component_config(
                    id,
                    factory.create_default_config(),
                    settings.config.connectors.get(id),
                );
                log_stability(Kind::Connector, id, factory.stability(T::KIND, *to));
                let connector = T::create_connector(factory.as_ref(), &create, &config, next)
                    .map_err(|source| create_error(node, source))?;
                let component: Arc<dyn Component> = connector.clone();
                self.components.insert(node.clone(), component);
                self.consumers.insert(node.clone(), T::wrap(connector));
            }
        }
        Ok(())
    }

    fn next_consumers<T: SignalType>(&self, node: &NodeId) -> Vec<DynConsumer<T>> {
        self.successors
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|next| self.consumers.get(next))
            .filter_map(T::unwrap)
            .collect()
    }

    fn single_next<T: SignalType>(&self, node: &NodeId) -> Result<DynConsumer<T>, GraphError> {
        self.next_consumers::<T>(node)
            .into_iter()
            .next()
            .ok_or(GraphError::NilNextConsumer)
    }
}

fn parse_pipelines(
    config: &ServiceConfig,
) -> Result<BTreeMap<PipelineId, &PipelineConfig>, GraphError> {
    if config.service.pipelines.is_empty() {
        return Err(GraphError::NoPipelines);
    }
    let mut pipelines = BTreeMap::new();
    for (text, pipeline) in &config.service.pipelines {
        let id: PipelineId = text.parse().map_err(|source| match source {
            IdError::UnknownSignal(signal) => GraphError::UnknownSignal {
                text: text.clone(),
                signal,
            },
            source => GraphError::InvalidPipelineId {
                text: text.clone(),
                source,
            },
        })?;
        pipelines.insert(id, pipeline);
    }
    Ok(pipelines)
}

fn validate_pipeline(
    id: &PipelineId,
    pipeline: &PipelineConfig,
    settings: Settings<'_>,
) -> Result<(), GraphError> {
    if pipeline.receivers.is_empty() {
        return Err(GraphError::MissingReceivers(id.clone()));
    }
    if pipeline.exporters.is_empty() {
        return Err(GraphError::MissingExporters(id.clone()));
    }

    let config = settings.config;
    let factories = settings.factories;
    let not_configured = |kind: Kind, component: &ComponentId| GraphError::NotConfigured {
        location: format!("pipeline \"{id}\""),
        kind,
        id: component.clone(),
    };

    for receiver in &pipeline.receivers {
        if config.connectors.contains_key(receiver) {
            continue;
        }
        if !config.receivers.contains_key(receiver) {
            return Err(not_configured(Kind::Receiver, receiver));
        }
        if factories.receivers.get(receiver.component_type()).is_none() {
            return Err(factory_not_found(Kind::Receiver, receiver));
        }
    }

    let mut seen = BTreeSet::new();
    for processor in &pipeline.processors {
        if !config.processors.contains_key(processor) {
            return Err(not_configured(Kind::Processor, processor));
        }
        if !seen.insert(processor) {
            return Err(GraphError::DuplicateProcessor {
                pipeline: id.clone(),
                id: processor.clone(),
            });
        }
        if factories.processors.get(processor.component_type()).is_none() {
            return Err(factory_not_found(Kind::Processor, processor));
        }
    }

    for exporter in &pipeline.exporters {
        if config.connectors.contains_key(exporter) {
            continue;
        }
        if !config.exporters.contains_key(exporter) {
            return Err(not_configured(Kind::Exporter, exporter));
        }
        if factories.exporters.get(exporter.component_type()).is_none() {
            return Err(factory_not_found(Kind::Exporter, exporter));
        }
    }
    Ok(())
}

/// Every connector in use must be an exporter and a receiver, and each of
/// its uses needs a counterpart pipeline whose signal pair it supports.
fn validate_connectors(
    pipelines: &BTreeMap<PipelineId, &PipelineConfig>,
    settings: Settings<'_>,
) -> Result<(), GraphError> {
    for id in settings.config.connectors.keys() {
        if settings.factories.connectors.get(id.component_type()).is_none() {
            if settings.config.is_referenced(id) {
                return Err(factory_not_found(Kind::Connector, id));
            }
            continue;
        }

        for (source_id, source) in pipelines {
            if !source.exporters.contains(id) {
                continue;
            }
            let supported = pipelines.iter().any(|(target_id, target)| {
                target.receivers.contains(id)
                    && connects(settings, id, source_id.signal(), target_id.signal())
            });
            if !supported {
                return Err(GraphError::ConnectorUnused {
                    id: id.clone(),
                    pipeline: source_id.clone(),
                    used_as: Kind::Exporter,
                    missing_as: Kind::Receiver,
                });
            }
        }

        for (target_id, target) in pipelines {
            if !target.receivers.contains(id) {
                continue;
            }
            let supported = pipelines.iter().any(|(source_id, source)| {
                source.exporters.contains(id)
                    && connects(settings, id, source_id.signal(), target_id.signal())
            });
            if !supported {
                return Err(GraphError::ConnectorUnused {
                    id: id.clone(),
                    pipeline: target_id.clone(),
                    used_as: Kind::Receiver,
                    missing_as: Kind::Exporter,
                });
            }
        }
    }
    Ok(())
}

fn connects(settings: Settings<'_>, id: &ComponentId, from: Signal, to: Signal) -> bool {
    settings
        .factories
        .connectors
        .get(id.component_type())
        .is_some_and(|factory| factory.stability(from, to).is_supported())
}

fn create_settings(id: &ComponentId, kind: Kind, settings: Settings<'_>) -> CreateSettings {
    CreateSettings::new(id.clone(), kind, settings.build_info.clone())
}

fn component_config(id: &ComponentId, defaults: Value, user: Option<&Value>) -> ComponentConfig {
    ComponentConfig::merged(id.clone(), defaults, user)
}

fn factory_not_found(kind: Kind, id: &ComponentId) -> GraphError {
    GraphError::FactoryNotFound {
        kind,
        id: id.clone(),
    }
}

fn create_error(node: &NodeId, source: ComponentError) -> GraphError {
    GraphError::Create {
        node: node.to_string(),
        source,
    }
}
