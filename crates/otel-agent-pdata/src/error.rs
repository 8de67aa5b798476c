//! Error types for batch decoding.

use thiserror::Error;

/// A marshaled batch could not be decoded.
#[derive(Debug, Error)]
#[error("failed to decode {signal} batch")]
pub struct DecodeError {
    signal: &'static str,
    #[source]
    source: prost::DecodeError,
}

impl DecodeError {
    pub(crate) fn new(signal: &'static str, source: prost::DecodeError) -> Self {
        Self { signal, source }
    }

    /// Returns the signal whose batch failed to decode.
    pub fn signal(&self) -> &'static str {
        self.signal
    }
}
