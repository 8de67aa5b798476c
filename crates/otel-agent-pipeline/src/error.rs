//! Error types for the pipeline runtime.

use crate::component::{ComponentId, ComponentType, Kind};
use crate::consumer::BoxError;
use crate::pipeline::{PipelineId, Signal};
use crate::queue::QueueError;
use thiserror::Error;

/// A component or pipeline id could not be parsed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The type (or signal) part is empty.
    #[error("id must not have an empty type")]
    EmptyType,

    /// The type token contains invalid characters.
    #[error("invalid character(s) in type {0:?}")]
    InvalidType(String),

    /// A `/` separator is followed by nothing.
    #[error("name part must be specified after '/' in id")]
    EmptyName,

    /// The name contains whitespace or control characters.
    #[error("invalid character(s) in name {0:?}")]
    InvalidName(String),

    /// The signal part of a pipeline id is not a known signal.
    #[error("unknown signal {0:?}")]
    UnknownSignal(String),
}

/// Errors raised by components while being created, started or stopped.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ComponentError {
    /// The factory has no constructor for the requested signal.
    #[error("{kind} \"{id}\" does not support the {signal} signal")]
    SignalNotSupported {
        /// Kind of the component.
        kind: Kind,
        /// Id of the component.
        id: ComponentId,
        /// Requested signal.
        signal: Signal,
    },

    /// The connector factory has no constructor for the requested signal pair.
    #[error("connector \"{id}\" cannot connect {from} to {to}")]
    ConnectionNotSupported {
        /// Id of the connector.
        id: ComponentId,
        /// Signal of the pipeline the connector exports from.
        from: Signal,
        /// Signal of the pipeline the connector receives into.
        to: Signal,
    },

    /// The configuration could not be decoded into the component's settings.
    #[error("invalid configuration for \"{id}\": {source}")]
    InvalidConfig {
        /// Id of the component.
        id: ComponentId,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// Starting failed.
    #[error("failed to start: {0}")]
    Start(#[source] BoxError),

    /// Stopping failed.
    #[error("failed to shut down: {0}")]
    Shutdown(#[source] BoxError),

    /// The sending queue failed to start or stop.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Several failures.
    #[error("{}", display_joined(.0))]
    Joined(Vec<ComponentError>),
}

impl ComponentError {
    /// Wraps a start failure.
    pub fn start(error: impl Into<BoxError>) -> Self {
        Self::Start(error.into())
    }

    /// Wraps a shutdown failure.
    pub fn shutdown(error: impl Into<BoxError>) -> Self {
        Self::Shutdown(error.into())
    }

    /// Joins a list of errors; `Ok(())` when empty.
    pub fn join(mut errors: Vec<ComponentError>) -> Result<(), ComponentError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ComponentError::Joined(errors)),
        }
    }
}

/// Duplicate factory registration.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two factories of the same kind claim the same type.
    #[error("duplicate {kind} factory \"{ty}\"")]
    DuplicateFactory {
        /// Kind of the registry.
        kind: Kind,
        /// The type registered twice.
        ty: ComponentType,
    },
}

/// Errors raised while validating, building, starting or stopping the graph.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GraphError {
    /// The service declares no pipeline.
    #[error("service must have at least one pipeline")]
    NoPipelines,

    /// A pipeline key is not a valid pipeline id.
    #[error("invalid pipeline id {text:?}")]
    InvalidPipelineId {
        /// The offending key.
        text: String,
        /// Parse failure.
        #[source]
        source: IdError,
    },

    /// A pipeline key names a signal the agent does not know.
    #[error("pipeline {text:?}: unknown signal {signal:?}")]
    UnknownSignal {
        /// The offending key.
        text: String,
        /// The unrecognised signal.
        signal: String,
    },

    /// A pipeline lists no receivers.
    #[error("pipeline \"{0}\" must have at least one receiver")]
    MissingReceivers(PipelineId),

    /// A pipeline lists no exporters.
    #[error("pipeline \"{0}\" must have at least one exporter")]
    MissingExporters(PipelineId),

    /// A pipeline lists the same processor twice.
    #[error("pipeline \"{pipeline}\" references processor \"{id}\" multiple times")]
    DuplicateProcessor {
        /// The pipeline.
        pipeline: PipelineId,
        /// The repeated processor.
        id: ComponentId,
    },

    /// A pipeline or the service references an id with no configuration.
    #[error("{location} references {kind} \"{id}\" which is not configured")]
    NotConfigured {
        /// Where the reference was found, e.g. `pipeline "traces"`.
        location: String,
        /// Kind the reference was expected to be.
        kind: Kind,
        /// The unresolved id.
        id: ComponentId,
    },

    /// No factory is registered for a configured component's type.
    #[error("{kind} factory not available for \"{id}\"")]
    FactoryNotFound {
        /// Kind of the component.
        kind: Kind,
        /// The component.
        id: ComponentId,
    },

    /// A connector is not used on both of its sides.
    #[error("connector \"{id}\" used as {used_as} in \"{pipeline}\" but not used in any supported {missing_as} pipeline")]
    ConnectorUnused {
        /// The connector.
        id: ComponentId,
        /// Pipeline where it is used.
        pipeline: PipelineId,
        /// Side it is used on.
        used_as: Kind,
        /// Side it is missing from.
        missing_as: Kind,
    },

    /// A consumer list handed to a fan-out was empty.
    #[error("nil next consumer")]
    NilNextConsumer,

    /// Connectors form a loop between pipelines.
    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// A factory failed to create a component.
    #[error("failed to create {node}: {source}")]
    Create {
        /// Graph node being created.
        node: String,
        /// Factory failure.
        #[source]
        source: ComponentError,
    },

    /// A component failed to start.
    #[error("failed to start {node}: {source}")]
    Start {
        /// Graph node being started.
        node: String,
        /// Start failure.
        #[source]
        source: ComponentError,
    },

    /// A component failed to stop.
    #[error("failed to shut down {node}: {source}")]
    Shutdown {
        /// Graph node being stopped.
        node: String,
        /// Shutdown failure.
        #[source]
        source: ComponentError,
    },

    /// Several failures.
    #[error("{}", display_joined(.0))]
    Joined(Vec<GraphError>),
}

impl GraphError {
    /// Joins a list of errors; `Ok(())` when empty.
    pub fn join(mut errors: Vec<GraphError>) -> Result<(), GraphError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(GraphError::Joined(errors)),
        }
    }
}

fn display_joined<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
