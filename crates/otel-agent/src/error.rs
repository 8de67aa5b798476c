//! Error types for the agent.

use crate::config::ConfigError;
use otel_agent_pipeline::{GraphError, RegistryError};
use thiserror::Error;

/// A specialised Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while running the agent.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Two built-in factories claim the same component type.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The pipelines could not be built, started or stopped.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Installing a signal handler failed.
    #[error("failed to listen for shutdown signals")]
    Signal(#[source] std::io::Error),
}
