//! Telemetry batch types for the agent's pipelines.
//!
//! Every signal travels through the agent as one of three batch types, each a
//! thin handle around the OTLP export request of its signal:
//!
//! - [`Traces`] wraps `ExportTraceServiceRequest`
//! - [`Metrics`] wraps `ExportMetricsServiceRequest`
//! - [`Logs`] wraps `ExportLogsServiceRequest`
//!
//! # Copy-on-share
//!
//! A batch handed to several consumers is not copied up front. Instead the
//! producer calls [`Batch::as_shared`], which marks the batch shared and returns
//! a second handle onto the same request. Reading through any handle is free.
//! Mutating through [`Traces::request_mut`] (and the metrics/logs equivalents)
//! clones the request first whenever another handle still refers to it, so a
//! mutation is never observed by the other holders.
//!
//! ```
//! use otel_agent_pdata::{Batch, Traces};
//!
//! let mut original = Traces::default();
//! let mut copy = original.as_shared();
//! assert!(copy.is_shared());
//! assert!(copy.same_request(&original));
//!
//! copy.request_mut().resource_spans.push(Default::default());
//! assert!(!copy.same_request(&original));
//! assert!(original.request().resource_spans.is_empty());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod logs;
mod metrics;
mod payload;
mod traces;

pub use error::DecodeError;
pub use logs::Logs;
pub use metrics::{Metrics, metric_data_points};
pub use traces::Traces;

/// Re-export of the OTLP protobuf types the batches wrap.
pub use opentelemetry_proto::tonic as proto;

/// Operations the pipeline runtime invokes on any telemetry batch.
pub trait Batch: Default + std::fmt::Debug + Send + Sync + 'static {
    /// Lowercase signal name, used in logs and storage namespaces.
    const SIGNAL: &'static str;

    /// Number of leaf records: spans, metric data points or log records.
    fn item_count(&self) -> usize;

    /// Returns whether this handle aliases a request held elsewhere.
    fn is_shared(&self) -> bool;

    /// Marks this batch shared and returns a second handle onto the same request.
    fn as_shared(&mut self) -> Self;

    /// Returns whether two handles refer to the same underlying request.
    fn same_request(&self, other: &Self) -> bool;

    /// Transfers the content into `dest`, leaving `self` empty.
    fn move_to(&mut self, dest: &mut Self) {
        *dest = std::mem::take(self);
    }

    /// Deep-copies the content into `dest`.
    fn copy_to(&self, dest: &mut Self);

    /// Returns an independent deep copy.
    fn deep_copy(&self) -> Self {
        let mut dest = Self::default();
        self.copy_to(&mut dest);
        dest
    }

    /// Encodes the batch as its OTLP protobuf request.
    fn marshal(&self) -> Vec<u8>;

    /// Decodes a batch previously produced by [`Batch::marshal`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the bytes are not a valid request.
    fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError>;
}
