//! Connector that turns any signal into count metrics.
//!
//! For every batch consumed, one monotonic delta sum per resource is emitted
//! into the metrics pipelines the connector feeds. The resource is copied so
//! counts stay attributable to their source.

use crate::components::default_config;
use async_trait::async_trait;
use otel_agent_pipeline::factory::{ConnectorFactory, DynConnector, Factory};
use otel_agent_pipeline::pdata::proto::collector::metrics::v1::ExportMetricsServiceRequest;
use otel_agent_pipeline::pdata::proto::common::v1::InstrumentationScope;
use otel_agent_pipeline::pdata::proto::metrics::v1::{
    AggregationTemporality, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, Sum,
    metric::Data, number_data_point,
};
use otel_agent_pipeline::pdata::proto::resource::v1::Resource;
use otel_agent_pipeline::pdata::{Batch, Logs, Metrics, Traces, metric_data_points};
use otel_agent_pipeline::{
    Capabilities, Component, ComponentConfig, ComponentError, ComponentType, ConsumeError,
    Consumer, Context, CreateSettings, DynConsumer, Host, Signal, StabilityLevel,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const SCOPE_NAME: &str = "otel-agent/count";

/// Name and description of one emitted metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricInfo {
    /// Metric name.
    pub name: String,
    /// Metric description.
    #[serde(default)]
    pub description: String,
}

impl MetricInfo {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// Settings of a `count` connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CountConfig {
    /// Metric emitted for traces pipelines.
    pub spans: MetricInfo,
    /// Metric emitted for metrics pipelines.
    pub datapoints: MetricInfo,
    /// Metric emitted for logs pipelines.
    pub logs: MetricInfo,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            spans: MetricInfo::new("trace.span.count", "The number of spans observed."),
            datapoints: MetricInfo::new(
                "metric.datapoint.count",
                "The number of data points observed.",
            ),
            logs: MetricInfo::new("log.record.count", "The number of log records observed."),
        }
    }
}

/// Item counts of a batch, grouped by resource.
pub trait Countable: Batch {
    /// Returns each resource with the number of items it holds.
    fn counts_per_resource(&self) -> Vec<(Option<&Resource>, usize)>;
}

impl Countable for Traces {
    fn counts_per_resource(&self) -> Vec<(Option<&Resource>, usize)> {
        self.request()
            .resource_spans
            .iter()
            .map(|rs| {
                let spans = rs.scope_spans.iter().map(|ss| ss.spans.len()).sum();
                (rs.resource.as_ref(), spans)
            })
            .collect()
    }
}

impl Countable for Metrics {
    fn counts_per_resource(&self) -> Vec<(Option<&Resource>, usize)> {
        self.resource_metrics()
            .iter()
            .map(|rm| {
                let points = rm
                    .scope_metrics
                    .iter()
                    .flat_map(|sm| &sm.metrics)
                    .map(metric_data_points)
                    .sum();
                (rm.resource.as_ref(), points)
            })
            .collect()
    }
}

impl Countable for Logs {
    fn counts_per_resource(&self) -> Vec<(Option<&Resource>, usize)> {
        self.request()
            .resource_logs
            .iter()
            .map(|rl| {
                let records = rl.scope_logs.iter().map(|sl| sl.log_records.len()).sum();
                (rl.resource.as_ref(), records)
            })
            .collect()
    }
}

/// Counts the items of every batch and emits the counts as metrics.
pub struct CountConnector<T: Countable> {
    metric: MetricInfo,
    next: DynConsumer<Metrics>,
    _signal: std::marker::PhantomData<fn(T)>,
}

impl<T: Countable> CountConnector<T> {
    fn count(&self, batch: &T) -> Metrics {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let resource_metrics = batch
            .counts_per_resource()
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(resource, count)| ResourceMetrics {
                resource: resource.cloned(),
                scope_metrics: vec![ScopeMetrics {
                    scope: Some(InstrumentationScope {
                        name: SCOPE_NAME.to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        ..Default::default()
                    }),
                    metrics: vec![Metric {
                        name: self.metric.name.clone(),
                        description: self.metric.description.clone(),
                        data: Some(Data::Sum(Sum {
                            data_points: vec![NumberDataPoint {
                                time_unix_nano: now,
                                value: Some(number_data_point::Value::AsInt(count as i64)),
                                ..Default::default()
                            }],
                            aggregation_temporality: AggregationTemporality::Delta as i32,
                            is_monotonic: true,
                        })),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            })
            .collect();

        Metrics::new(ExportMetricsServiceRequest { resource_metrics })
    }
}

#[async_trait]
impl<T: Countable> Consumer<T> for CountConnector<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        let counts = self.count(&batch);
        if counts.resource_metrics().is_empty() {
            return Ok(());
        }
        self.next.consume(ctx, counts).await
    }
}

#[async_trait]
impl<T: Countable> Component for CountConnector<T> {
    async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Factory for `count` connectors.
#[derive(Debug, Default)]
pub struct CountConnectorFactory;

impl CountConnectorFactory {
    fn create<T: Countable>(
        config: &ComponentConfig,
        pick: fn(CountConfig) -> MetricInfo,
        next: DynConsumer<Metrics>,
    ) -> Result<DynConnector<T>, ComponentError> {
        let config: CountConfig = config.parse()?;
        Ok(Arc::new(CountConnector::<T> {
            metric: pick(config),
            next,
            _signal: std::marker::PhantomData,
        }))
    }
}

impl Factory for CountConnectorFactory {
    fn component_type(&self) -> ComponentType {
        ComponentType::from_static("count")
    }

    fn create_default_config(&self) -> serde_json::Value {
        default_config::<CountConfig>()
    }
}

impl ConnectorFactory for CountConnectorFactory {
    fn stability(&self, from: Signal, to: Signal) -> StabilityLevel {
        match (from, to) {
            (Signal::Traces | Signal::Metrics | Signal::Logs, Signal::Metrics) => {
                StabilityLevel::Alpha
            }
            _ => StabilityLevel::Undefined,
        }
    }

    fn create_traces_to_metrics(
        &self,
        _settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynConnector<Traces>, ComponentError> {
        Self::create(config, |c| c.spans, next)
    }

    fn create_metrics_to_metrics(
        &self,
        _settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynConnector<Metrics>, ComponentError> {
        Self::create(config, |c| c.datapoints, next)
    }

    fn create_logs_to_metrics(
        &self,
        _settings: &CreateSettings,
        config: &ComponentConfig,
        next: DynConsumer<Metrics>,
    ) -> Result<DynConnector<Logs>, ComponentError> {
        Self::create(config, |c| c.logs, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otel_agent_pipeline::pdata::proto::common::v1::{AnyValue, KeyValue, any_value};
    use otel_agent_pipeline::testing::{SinkConsumer, logs_with_records, traces_with_spans};
    use otel_agent_pipeline::{BuildInfo, Kind};
    use serde_json::json;

    fn config(user: Option<serde_json::Value>) -> ComponentConfig {
        ComponentConfig::merged(
            "count".parse().unwrap(),
            CountConnectorFactory.create_default_config(),
            user.as_ref(),
        )
    }

    fn settings() -> CreateSettings {
        CreateSettings::new("count".parse().unwrap(), Kind::Connector, BuildInfo::default())
    }

    fn sum_value(metrics: &Metrics, resource: usize) -> (String, i64) {
        let metric = &metrics.resource_metrics()[resource].scope_metrics[0].metrics[0];
        let Some(Data::Sum(sum)) = &metric.data else {
            panic!("expected a sum");
        };
        assert!(sum.is_monotonic);
        let Some(number_data_point::Value::AsInt(value)) = &sum.data_points[0].value else {
            panic!("expected an integer point");
        };
        (metric.name.clone(), *value)
    }

    #[tokio::test]
    async fn test_counts_spans_per_resource() {
        let sink = Arc::new(SinkConsumer::<Metrics>::new());
        let connector = CountConnectorFactory
            .create_traces_to_metrics(&settings(), &config(None), sink.clone())
            .unwrap();

        let mut traces = traces_with_spans(3);
        let mut second = traces_with_spans(2).into_request().resource_spans;
        second[0].resource = Some(Resource {
            attributes: vec![KeyValue {
                key: "service.name".to_string(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::StringValue("api".to_string())),
                }),
            }],
            ..Default::default()
        });
        traces.request_mut().resource_spans.extend(second);

        connector.consume(&Context::background(), traces).await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].resource_metrics().len(), 2);
        assert_eq!(sum_value(&batches[0], 0), ("trace.span.count".to_string(), 3));
        assert_eq!(sum_value(&batches[0], 1), ("trace.span.count".to_string(), 2));
        let resource = batches[0].resource_metrics()[1].resource.as_ref().unwrap();
        assert_eq!(resource.attributes[0].key, "service.name");
    }

    #[tokio::test]
    async fn test_custom_metric_name() {
        let sink = Arc::new(SinkConsumer::<Metrics>::new());
        let user = json!({ "logs": { "name": "agent.logs" } });
        let connector = CountConnectorFactory
            .create_logs_to_metrics(&settings(), &config(Some(user)), sink.clone())
            .unwrap();

        connector
            .consume(&Context::background(), logs_with_records(5))
            .await
            .unwrap();

        assert_eq!(sum_value(&sink.batches()[0], 0), ("agent.logs".to_string(), 5));
    }

    #[tokio::test]
    async fn test_empty_batch_emits_nothing() {
        let sink = Arc::new(SinkConsumer::<Metrics>::new());
        let connector = CountConnectorFactory
            .create_logs_to_metrics(&settings(), &config(None), sink.clone())
            .unwrap();

        connector
            .consume(&Context::background(), Logs::default())
            .await
            .unwrap();

        assert_eq!(sink.batch_count(), 0);
    }

    #[test]
    fn test_only_metrics_destination_is_supported() {
        let factory = CountConnectorFactory;
        assert_eq!(factory.stability(Signal::Logs, Signal::Metrics), StabilityLevel::Alpha);
        assert_eq!(factory.stability(Signal::Logs, Signal::Traces), StabilityLevel::Undefined);
        let sink = Arc::new(SinkConsumer::<Traces>::new());
        assert!(matches!(
            factory.create_logs_to_traces(&settings(), &config(None), sink),
            Err(ComponentError::ConnectionNotSupported { .. })
        ));
    }
}
