//! Log batches.

use crate::payload::Payload;
use crate::{Batch, DecodeError};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;

/// A batch of log records grouped by resource and instrumentation scope.
#[derive(Debug, Default, PartialEq)]
pub struct Logs {
    payload: Payload<ExportLogsServiceRequest>,
}

impl Logs {
    /// Wraps an export request.
    pub fn new(request: ExportLogsServiceRequest) -> Self {
        Self {
            payload: Payload::new(request),
        }
    }

    /// Returns the underlying request.
    pub fn request(&self) -> &ExportLogsServiceRequest {
        self.payload.get()
    }

    /// Returns the request for mutation, cloning it first if it is shared.
    pub fn request_mut(&mut self) -> &mut ExportLogsServiceRequest {
        self.payload.get_mut()
    }

    /// Consumes the batch and returns the request.
    pub fn into_request(self) -> ExportLogsServiceRequest {
        self.payload.into_inner()
    }

    /// Returns the resource groups of this batch.
    pub fn resource_logs(&self) -> &[ResourceLogs] {
        &self.request().resource_logs
    }

    /// Returns the number of log records in the batch.
    pub fn log_record_count(&self) -> usize {
        self.resource_logs()
            .iter()
            .flat_map(|rl| &rl.scope_logs)
            .map(|sl| sl.log_records.len())
            .sum()
    }
}

impl From<ExportLogsServiceRequest> for Logs {
    fn from(request: ExportLogsServiceRequest) -> Self {
        Self::new(request)
    }
}

impl Batch for Logs {
    const SIGNAL: &'static str = "logs";

    fn item_count(&self) -> usize {
        self.log_record_count()
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

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{AnyValue, any_value};
    use opentelemetry_proto::tonic::logs::v1::{LogRecord, ScopeLogs};
    use proptest::prelude::*;

    fn make_logs(records: usize) -> Logs {
        Logs::new(ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                scope_logs: vec![ScopeLogs {
                    log_records: vec![LogRecord::default(); records],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    #[test]
    fn test_log_record_count() {
        assert_eq!(make_logs(4).item_count(), 4);
    }

    #[test]
    fn test_marshal_round_trip() {
        let batch = make_logs(2);
        assert_eq!(Logs::unmarshal(&batch.marshal()).unwrap(), batch);
    }

    #[test]
    fn test_json_representation_uses_otlp_field_names() {
        let batch = make_logs(1);
        let json = serde_json::to_string(batch.request()).unwrap();
        assert!(json.contains("resourceLogs"));
    }

    fn arb_record() -> impl Strategy<Value = LogRecord> {
        (".{0,32}", 0i32..=24, any::<u64>()).prop_map(|(body, severity, time)| LogRecord {
            body: Some(AnyValue {
                value: Some(any_value::Value::StringValue(body)),
            }),
            severity_number: severity,
            time_unix_nano: time,
            ..Default::default()
        })
    }

    proptest! {
        #[test]
        fn marshal_roundtrips(
            scopes in prop::collection::vec(prop::collection::vec(arb_record(), 0..6), 0..4),
        ) {
            let batch = Logs::new(ExportLogsServiceRequest {
                resource_logs: vec![ResourceLogs {
                    scope_logs: scopes
                        .into_iter()
                        .map(|log_records| ScopeLogs {
                            log_records,
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
            });
            let decoded = Logs::unmarshal(&batch.marshal()).unwrap();
            prop_assert_eq!(decoded.item_count(), batch.item_count());
            prop_assert_eq!(decoded, batch);
        }
    }
}
