//! Trace batches.

use crate::payload::Payload;
use crate::{Batch, DecodeError};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;

/// A batch of spans grouped by resource and instrumentation scope.
#[derive(Debug, Default, PartialEq)]
pub struct Traces {
    payload: Payload<ExportTraceServiceRequest>,
}

impl Traces {
    /// Wraps an export request.
    pub fn new(request: ExportTraceServiceRequest) -> Self {
        Self {
            payload: Payload::new(request),
        }
    }

    /// Returns the underlying request.
    pub fn request(&self) -> &ExportTraceServiceRequest {
        self.payload.get()
    }

    /// Returns the request for mutation, cloning it first if it is shared.
    pub fn request_mut(&mut self) -> &mut ExportTraceServiceRequest {
        self.payload.get_mut()
    }

    /// Consumes the batch and returns the request.
    pub fn into_request(self) -> ExportTraceServiceRequest {
        self.payload.into_inner()
    }

    /// Returns the resource groups of this batch.
    pub fn resource_spans(&self) -> &[ResourceSpans] {
        &self.request().resource_spans
    }

    /// Returns the number of spans in the batch.
    pub fn span_count(&self) -> usize {
        self.resource_spans()
            .iter()
            .flat_map(|rs| &rs.scope_spans)
            .map(|ss| ss.spans.len())
            .sum()
    }
}

impl From<ExportTraceServiceRequest> for Traces {
    fn from(request: ExportTraceServiceRequest) -> Self {
        Self::new(request)
    }
}

impl Batch for Traces {
    const SIGNAL: &'static str = "traces";

    fn item_count(&self) -> usize {
        self.span_count()
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
