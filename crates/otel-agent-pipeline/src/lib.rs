//! Pipeline runtime for the telemetry agent.
//!
//! This crate turns a declarative pipeline configuration into a running graph
//! of components and provides the machinery every component relies on:
//!
//! - **Identity**: [`ComponentId`] and [`PipelineId`] with their text forms
//! - **Consumer contract**: [`Consumer`], [`ConsumeError`] and [`Capabilities`]
//! - **Fan-out**: [`fanout::new_fanout`] with copy-on-share dispatch
//! - **Factories**: per-kind factory traits and the [`Factories`] registry
//! - **Queues**: a bounded [`MemoryQueue`] and a [`PersistentQueue`] backed
//!   by a storage extension
//! - **Exporter helper**: timeout, retry and queueing around a send function
//! - **Graph**: validation, topological build, start and shutdown ordering
//!
//! # Example
//!
//! ```no_run
//! use otel_agent_pipeline::{BuildInfo, Factories, Service, ServiceConfig};
//!
//! # async fn run(config: ServiceConfig, factories: Factories) -> Result<(), Box<dyn std::error::Error>> {
//! let service = Service::new(BuildInfo::default(), &config, &factories)?;
//! service.start().await?;
//! // ... run until a shutdown signal arrives ...
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod component;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod exporter;
pub mod factory;
pub mod fanout;
pub mod graph;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod sharedcomponent;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use component::{
    BuildInfo, Component, ComponentId, ComponentType, CreateSettings, Extension, Host, Kind,
    StabilityLevel,
};
pub use config::{PipelineConfig, ServiceConfig};
pub use consumer::{Capabilities, ConsumeError, Consumer, DynConsumer};
pub use context::Context;
pub use exporter::{Export, ExporterHelper, HelperConfig, RetryConfig};
pub use error::{ComponentError, GraphError, IdError, RegistryError};
pub use factory::{
    ComponentConfig, ConnectorFactory, ExporterFactory, ExtensionFactory, Factories,
    ProcessorFactory, ReceiverFactory,
};
pub use graph::{Graph, NodeId};
pub use pipeline::{PipelineId, Signal};
pub use queue::{MemoryQueue, PersistentQueue, Queue, QueueConfig, QueueError};
pub use service::Service;
pub use storage::{StorageClient, StorageError, StorageExtension};

pub use otel_agent_pdata as pdata;
