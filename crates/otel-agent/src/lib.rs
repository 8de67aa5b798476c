//! Telemetry collection agent.
//!
//! Receives OTLP over HTTP, runs the data through configurable pipelines of
//! processors and connectors, and exports it to OTLP/HTTP backends. The
//! pipeline machinery lives in `otel-agent-pipeline`; this crate provides the
//! components, the configuration loader and the runtime that ties them
//! together.
//!
//! # Components
//!
//! | Kind | Types |
//! |------|-------|
//! | Receivers | `otlp` |
//! | Processors | `batch`, `resource` |
//! | Exporters | `otlphttp`, `debug` |
//! | Connectors | `forward`, `count` |
//! | Extensions | `file_storage`, `memory_storage` |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod components;
pub mod config;
pub mod connector;
pub mod error;
pub mod exporter;
pub mod extension;
pub mod processor;
pub mod receiver;
pub mod runtime;

pub use components::default_factories;
pub use config::{ConfigBuilder, ConfigError};
pub use error::{AgentError, Result};
pub use runtime::Runtime;
