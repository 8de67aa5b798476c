//! Connector joining pipelines of the same signal.
//!
//! Whatever one pipeline exports into `forward` is received by every pipeline
//! listing it as a receiver, unchanged.

use async_trait::async_trait;
use otel_agent_pipeline::factory::{ConnectorFactory, DynConnector, Factory};
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces};
use otel_agent_pipeline::{
    Capabilities, Component, ComponentConfig, ComponentError, ComponentType, ConsumeError,
    Consumer, Context, CreateSettings, DynConsumer, Host, Signal, StabilityLevel,
};
use std::sync::Arc;

/// Passes batches on to the pipelines it feeds.
pub struct ForwardConnector<T: Batch> {
    next: DynConsumer<T>,
}

#[async_trait]
impl<T: Batch> Consumer<T> for ForwardConnector<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        self.next.consume(ctx, batch).await
    }
}

#[async_trait]
impl<T: Batch> Component for ForwardConnector<T> {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Factory for `forward` connectors.
#[derive(Debug, Default)]
pub struct ForwardConnectorFactory;

fn forward<T: Batch>(next: DynConsumer<T>) -> DynConnector<T> {
    Arc::new(ForwardConnector { next })
}

impl Factory for ForwardConnectorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("forward")
    }
}

impl ConnectorFactory for ForwardConnectorFactory {
    fn stability(&self, from: Signal, to: Signal) -> StabilityLevel {
        if from == to && from != Signal::Profiles {
            StabilityLevel::Beta
        } else {
            StabilityLevel::Undefined
        }
    }

    fn create_traces_to_traces(
        &self,
        _settings: &CreateSettings,
        _config: &ComponentConfig,
        next: DynConsumer<Traces>,
    ) -> Result<DynConnector<Traces>, ComponentError> {
        Ok(forward(next))
    }

    fn create_metrics_to_metrics(
        &self,
        _settings: &CreateSettings,
        _config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynConnector<Metrics>, ComponentError> {
        Ok(forward(next))
    }

    fn create_logs_to_logs(
        &self,
        _settings: &CreateSettings,
        _config: &ComponentConfig,
        next: DynConsumer<Logs>,
    ) -> Result<DynConnector<Logs>, ComponentError> {
        Ok(forward(next))
    }
}
