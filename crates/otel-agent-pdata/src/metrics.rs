//! Metric batches.

use crate::payload::Payload;
use crate::{Batch, DecodeError};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::metrics::v1::{Metric, ResourceMetrics, metric::Data};

/// A batch of metrics grouped by resource and instrumentation scope.
#[derive(Debug, Default, PartialEq)]
pub struct Metrics {
    payload: Payload<ExportMetricsServiceRequest>,
}

impl Metrics {
    /// Wraps an export request.
    pub fn new(request: ExportMetricsServiceRequest) -> Self {
        Self {
            payload: Payload::new(request),
        }
    }

    /// Returns the underlying request.
    pub fn request(&self) -> &ExportMetricsServiceRequest {
        self.payload.get()
    }

    /// Returns the request for mutation, cloning it first if it is shared.
    pub fn request_mut(&mut self) -> &mut ExportMetricsServiceRequest {
        self.payload.get_mut()
    }

    /// Consumes the batch and returns the request.
    pub fn into_request(self) -> ExportMetricsServiceRequest {
        self.payload.into_inner()
    }

    /// Returns the resource groups of this batch.
    pub fn resource_metrics(&self) -> &[ResourceMetrics] {
        &self.request().resource_metrics
    }

    /// Returns the number of metrics, regardless of their data points.
    pub fn metric_count(&self) -> usize {
        self.metrics().count()
    }

    /// Returns the number of data points across all metrics.
    pub fn data_point_count(&self) -> usize {
        self.metrics().map(metric_data_points).sum()
    }

    fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.resource_metrics()
            .iter()
            .flat_map(|rm| &rm.scope_metrics)
            .flat_map(|sm| &sm.metrics)
    }
}

/// Returns the number of data points of one metric, whatever its type.
pub fn metric_data_points(metric: &Metric) -> usize {
    match &metric.data {
        Some(Data::Gauge(gauge)) => gauge.data_points.len(),
        Some(Data::Sum(sum)) => sum.data_points.len(),
        Some(Data::Histogram(histogram)) => histogram.data_points.len(),
        Some(Data::ExponentialHistogram(histogram)) => histogram.data_points.len(),
        Some(Data::Summary(summary)) => summary.data_points.len(),
        None => 0,
    }
}

impl From<ExportMetricsServiceRequest> for Metrics {
    fn from(request: ExportMetricsServiceRequest) -> Self {
        Self::new(request)
    }
}

impl Batch for Metrics {
    const SIGNAL: &'static str = "metrics";

    fn item_count(&self) -> usize {
        self.data_point_count()
    }

    fn is_shared(&self) -> bool {
        self.payload.is_shared()
    }

    fn as_shared(&mut self) -> Self {
        Self {
            payload: self.payload.share(),
        }
    }

    fn same_request(&self, other: &Self) -> bool {
        self.payload.same(&other.payload)
    }

    fn copy_to(&self, dest: &mut Self) {
        dest.payload = self.payload.deep_copy();
    }

    fn marshal(&self) -> Vec<u8> {
        self.payload.encode()
    }

    fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError> {
        Payload::decode(Self::SIGNAL, bytes).map(|payload| Self { payload })
    }
}
