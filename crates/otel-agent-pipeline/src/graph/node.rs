//! Graph node identities and signal-erased consumers.

use crate::component::{ComponentId, CreateSettings, Kind};
use crate::consumer::DynConsumer;
use crate::error::ComponentError;
use crate::factory::{
    ComponentConfig, ConnectorFactory, DynConnector, DynExporter, DynProcessor, DynReceiver,
    ExporterFactory, ProcessorFactory, ReceiverFactory,
};
use crate::pipeline::{PipelineId, Signal};
use otel_agent_pdata::{Batch, Logs, Metrics, Traces};
use std::fmt;

/// One vertex of the pipeline graph.
///
/// Receivers and exporters are keyed by signal so that one instance serves
/// every pipeline of that signal. Processors belong to a single pipeline.
/// Connectors are keyed by the signal pair they join.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeId {
    /// A receiver emitting `signal`.
    Receiver {
        /// Receiver id.
        id: ComponentId,
        /// Emitted signal.
        signal: Signal,
    },
    /// Head of a pipeline advertising the combined processor capabilities.
    Capabilities {
        /// Owning pipeline.
        pipeline: PipelineId,
    },
    /// A processor instance of one pipeline.
    Processor {
        /// Owning pipeline.
        pipeline: PipelineId,
        /// Processor id.
        id: ComponentId,
    },
    /// Tail of a pipeline dispatching to its exporters.
    FanOut {
        /// Owning pipeline.
        pipeline: PipelineId,
    },
    /// An exporter consuming `signal`.
    Exporter {
        /// Exporter id.
        id: ComponentId,
        /// Consumed signal.
        signal: Signal,
    },
    /// A connector consuming `from` and emitting `to`.
    Connector {
        /// Connector id.
        id: ComponentId,
        /// Signal of the pipelines it exports from.
        from: Signal,
        /// Signal of the pipelines it receives into.
        to: Signal,
    },
}

impl NodeId {
    /// Returns the component behind the node, if it is one.
    pub fn component_id(&self) -> Option<&ComponentId> {
        match self {
            NodeId::Receiver { id, .. }
            | NodeId::Processor { id, .. }
            | NodeId::Exporter { id, .. }
            | NodeId::Connector { id, .. } => Some(id),
            NodeId::Capabilities { .. } | NodeId::FanOut { .. } => None,
        }
    }

    /// Returns the kind of component behind the node, if it is one.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            NodeId::Receiver { .. } => Some(Kind::Receiver),
            NodeId::Processor { .. } => Some(Kind::Processor),
            NodeId::Exporter { .. } => Some(Kind::Exporter),
            NodeId::Connector { .. } => Some(Kind::Connector),
            NodeId::Capabilities { .. } | NodeId::FanOut { .. } => None,
        }
    }

    /// Signal of the batches this node consumes, or emits for receivers.
    pub fn signal(&self) -> Signal {
        match self {
            NodeId::Receiver { signal, .. } | NodeId::Exporter { signal, .. } => *signal,
            NodeId::Capabilities { pipeline }
            | NodeId::Processor { pipeline, .. }
            | NodeId::FanOut { pipeline } => pipeline.signal(),
            NodeId::Connector { from, .. } => *from,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Receiver { id, signal } => write!(f, "receiver \"{id}\" ({signal})"),
            NodeId::Capabilities { pipeline } => write!(f, "capabilities of \"{pipeline}\""),
            NodeId::Processor { pipeline, id } => {
                write!(f, "processor \"{id}\" in pipeline \"{pipeline}\"")
            }
            NodeId::FanOut { pipeline } => write!(f, "fanout of \"{pipeline}\""),
            NodeId::Exporter { id, signal } => write!(f, "exporter \"{id}\" ({signal})"),
            NodeId::Connector { id, from, to } => {
                write!(f, "connector \"{id}\" ({from} to {to})")
            }
        }
    }
}

/// A consumer of any signal.
#[derive(Clone)]
pub(crate) enum AnyConsumer {
    Traces(DynConsumer<Traces>),
    Metrics(DynConsumer<Metrics>),
    Logs(DynConsumer<Logs>),
}

impl AnyConsumer {
    pub(crate) fn mutates_data(&self) -> bool {
        match self {
            AnyConsumer::Traces(c) => c.capabilities().mutates_data,
            AnyConsumer::Metrics(c) => c.capabilities().mutates_data,
            AnyConsumer::Logs(c) => c.capabilities().mutates_data,
        }
    }
}

/// Per-signal dispatch used while instantiating the graph.
pub(crate) trait SignalType: Batch {
    const KIND: Signal;

    fn wrap(consumer: DynConsumer<Self>) -> AnyConsumer;

    fn unwrap(consumer: &AnyConsumer) -> Option<DynConsumer<Self>>;

    fn create_receiver(
        factory: &dyn ReceiverFactory,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Self>,
    ) -> Result<DynReceiver, ComponentError>;

    fn create_processor(
        factory: &dyn ProcessorFactory,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Self>,
    ) -> Result<DynProcessor<Self>, ComponentError>;

    fn create_exporter(
        factory: &dyn ExporterFactory,
        settings: &CreateSettings,
        config: &ComponentConfig,
    ) -> Result<DynExporter<Self>, ComponentError>;

    /// Creates a connector consuming `Self` and emitting into `next`.
    fn create_connector(
        factory: &dyn ConnectorFactory,
        settings: &CreateSettings,
        config: &ComponentConfig,
        next: AnyConsumer,
    ) -> Result<DynConnector<Self>, ComponentError>;
}

macro_rules! signal_type {
    ($ty:ty, $variant:ident, $signal:expr, $create:ident, $to_traces:ident, $to_metrics:ident, $to_logs:ident) => {
        impl SignalType for $ty {
            const KIND: Signal = $signal;

            fn wrap(consumer: DynConsumer<Self>) -> AnyConsumer {
                AnyConsumer::$variant(consumer)
            }

            fn unwrap(consumer: &AnyConsumer) -> Option<DynConsumer<Self>> {
                match consumer {
                    AnyConsumer::$variant(c) => Some(c.clone()),
                    _ => None,
                }
            }

            fn create_receiver(
                factory: &dyn ReceiverFactory,
                settings: &CreateSettings,
                config: &ComponentConfig,
                next: DynConsumer<Self>,
            ) -> Result<DynReceiver, ComponentError> {
                factory.$create(settings, config, next)
            }

            fn create_processor(
                factory: &dyn ProcessorFactory,
                settings: &CreateSettings,
                config: &ComponentConfig,
                next: DynConsumer<Self>,
            ) -> Result<DynProcessor<Self>, ComponentError> {
                factory.$create(settings, config, next)
            }

            fn create_exporter(
                factory: &dyn ExporterFactory,
                settings: &CreateSettings,
                config: &ComponentConfig,
            ) -> Result<DynExporter<Self>, ComponentError> {
                factory.$create(settings, config)
            }

            fn create_connector(
                factory: &dyn ConnectorFactory,
                settings: &CreateSettings,
                config: &ComponentConfig,
                next: AnyConsumer,
            ) -> Result<DynConnector<Self>, ComponentError> {
                match next {
                    AnyConsumer::Traces(next) => factory.$to_traces(settings, config, next),
                    AnyConsumer::Metrics(next) => factory.$to_metrics(settings, config, next),
                    AnyConsumer::Logs(next) => factory.$to_logs(settings, config, next),
                }
            }
        }
    };
}

signal_type!(
    Traces,
    Traces,
    Signal::Traces,
    create_traces,
    create_traces_to_traces,
    create_traces_to_metrics,
    create_traces_to_logs
);
signal_type!(
    Metrics,
    Metrics,
    Signal::Metrics,
    create_metrics,
    create_metrics_to_traces,
    create_metrics_to_metrics,
    create_metrics_to_logs
);
signal_type!(
    Logs,
    Logs,
    Signal::Logs,
    create_logs,
    create_logs_to_traces,
    create_logs_to_metrics,
    create_logs_to_logs
);

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(text: &str) -> PipelineId {
        text.parse().unwrap()
    }

    #[test]
    fn test_display_names_kind_and_id() {
        let node = NodeId::Connector {
            id: "forward".parse().unwrap(),
            from: Signal::Traces,
            to: Signal::Metrics,
        };
        assert_eq!(node.to_string(), "connector \"forward\" (traces to metrics)");

        let node = NodeId::Processor {
            pipeline: pipeline("logs/audit"),
            id: "batch".parse().unwrap(),
        };
        assert_eq!(node.to_string(), "processor \"batch\" in pipeline \"logs/audit\"");
    }

    #[test]
    fn test_signal_of_each_node() {
        let connector = NodeId::Connector {
            id: "count".parse().unwrap(),
            from: Signal::Logs,
            to: Signal::Metrics,
        };
        assert_eq!(connector.signal(), Signal::Logs);
        assert_eq!(
            NodeId::FanOut {
                pipeline: pipeline("metrics")
            }
            .signal(),
            Signal::Metrics
        );
    }

    #[test]
    fn test_structural_nodes_have_no_component() {
        let caps = NodeId::Capabilities {
            pipeline: pipeline("traces"),
        };
        assert!(caps.component_id().is_none());
        let exporter = NodeId::Exporter {
            id: "debug".parse().unwrap(),
            signal: Signal::Traces,
        };
        assert_eq!(exporter.component_id().unwrap().to_string(), "debug");
    }
}
