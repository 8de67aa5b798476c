//! End-to-end tests of the agent runtime: OTLP in over HTTP, OTLP out to an
//! in-process backend.

mod common;

use common::{Backend, wait_for_http_ready, wait_until};
use otel_agent::Runtime;
use otel_agent::config::{ConfigBuilder, load_from_path};
use otel_agent_pipeline::ServiceConfig;
use otel_agent_pipeline::pdata::proto::collector::logs::v1::ExportLogsServiceRequest;
use otel_agent_pipeline::pdata::proto::collector::metrics::v1::ExportMetricsServiceRequest;
use otel_agent_pipeline::pdata::proto::collector::trace::v1::ExportTraceServiceRequest;
use otel_agent_pipeline::pdata::proto::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use otel_agent_pipeline::pdata::proto::metrics::v1::{metric::Data, number_data_point};
use otel_agent_pipeline::pdata::proto::trace::v1::{ResourceSpans, ScopeSpans, Span};
use prost::Message;
use serde_json::json;
use std::io::Write;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    token: CancellationToken,
    handle: JoinHandle<otel_agent::Result<()>>,
}

impl Running {
    async fn start(config: ServiceConfig, port: u16) -> Self {
        let runtime = Runtime::new(config).expect("factories");
        let token = runtime.cancellation_token();
        let handle = tokio::spawn(runtime.run());
        wait_for_http_ready(port, Duration::from_secs(5))
            .await
            .expect("Receiver failed to start");
        Self { token, handle }
    }

    async fn stop(self) {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("runtime did not stop")
            .expect("runtime task panicked")
            .expect("runtime failed");
    }
}

fn traces(spans: usize) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans: (0..spans)
                    .map(|i| Span {
                        name: format!("span-{i}"),
                        trace_id: vec![1; 16],
                        span_id: vec![i as u8 + 1; 8],
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn logs(records: usize) -> ExportLogsServiceRequest {
    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            scope_logs: vec![ScopeLogs {
                log_records: (0..records)
                    .map(|i| LogRecord {
                        time_unix_nano: i as u64 + 1,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

async fn post(port: u16, path: &str, body: Vec<u8>) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .header("Content-Type", "application/x-protobuf")
        .body(body)
        .send()
        .await
        .expect("Failed to send request")
        .status()
}

#[tokio::test]
async fn test_traces_flow_from_file_config_to_backend() {
    let backend = Backend::start().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[receivers.otlp]
endpoint = "127.0.0.1:14418"

[processors.batch]
timeout = 50

[exporters."otlphttp/backend"]
endpoint = "{}"
compression = "none"

[service.pipelines.traces]
receivers = ["otlp"]
processors = ["batch"]
exporters = ["otlphttp/backend"]
"#,
        backend.endpoint()
    )
    .unwrap();
    let config = load_from_path(file.path()).unwrap();

    let agent = Running::start(config, 14418).await;
    assert_eq!(
        post(14418, "/v1/traces", traces(3).encode_to_vec()).await,
        reqwest::StatusCode::OK
    );
    assert!(
        wait_until(Duration::from_secs(5), || !backend.bodies("/v1/traces").is_empty()).await,
        "backend received nothing"
    );
    agent.stop().await;

    let bodies = backend.bodies("/v1/traces");
    let received = ExportTraceServiceRequest::decode(bodies[0].as_ref()).unwrap();
    let names: Vec<_> = received.resource_spans[0].scope_spans[0]
        .spans
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(names, vec!["span-0", "span-1", "span-2"]);
}

#[tokio::test]
async fn test_unwired_signal_is_not_found() {
    let backend = Backend::start().await;
    let config = ConfigBuilder::new()
        .receiver("otlp", json!({ "endpoint": "127.0.0.1:14419" }))
        .exporter("otlphttp", json!({ "endpoint": backend.endpoint() }))
        .pipeline("traces", &["otlp"], &[], &["otlphttp"])
        .build()
        .unwrap();

    let agent = Running::start(config, 14419).await;
    assert_eq!(
        post(14419, "/v1/logs", logs(1).encode_to_vec()).await,
        reqwest::StatusCode::NOT_FOUND
    );
    agent.stop().await;
}

#[tokio::test]
async fn test_count_connector_turns_logs_into_metrics() {
    let backend = Backend::start().await;
    let config = ConfigBuilder::new()
        .receiver("otlp", json!({ "endpoint": "127.0.0.1:14420" }))
        .connector("count", json!({}))
        .exporter(
            "otlphttp",
            json!({ "endpoint": backend.endpoint(), "compression": "none" }),
        )
        .pipeline("logs", &["otlp"], &[], &["count"])
        .pipeline("metrics", &["count"], &[], &["otlphttp"])
        .build()
        .unwrap();

    let agent = Running::start(config, 14420).await;
    assert_eq!(
        post(14420, "/v1/logs", logs(4).encode_to_vec()).await,
        reqwest::StatusCode::OK
    );
    assert!(
        wait_until(Duration::from_secs(5), || !backend.bodies("/v1/metrics").is_empty()).await,
        "no count metric arrived"
    );
    agent.stop().await;

    let received =
        ExportMetricsServiceRequest::decode(backend.bodies("/v1/metrics")[0].as_ref()).unwrap();
    let metric = &received.resource_metrics[0].scope_metrics[0].metrics[0];
    assert_eq!(metric.name, "log.record.count");
    let Some(Data::Sum(sum)) = &metric.data else {
        panic!("expected a sum");
    };
    assert_eq!(
        sum.data_points[0].value,
        Some(number_data_point::Value::AsInt(4))
    );
    assert!(backend.bodies("/v1/logs").is_empty());
}

#[tokio::test]
async fn test_file_storage_queue_survives_restart() {
    let backend = Backend::start().await;
    backend.respond_with(503);
    let dir = tempfile::TempDir::new().unwrap();

    let config = || {
        ConfigBuilder::new()
            .receiver("otlp", json!({ "endpoint": "127.0.0.1:14421" }))
            .extension(
                "file_storage",
                json!({ "directory": dir.path().join("queue") }),
            )
            .exporter(
                "otlphttp",
                json!({
                    "endpoint": backend.endpoint(),
                    "compression": "none",
                    "retry_on_failure": { "initial_interval": 20, "max_interval": 50 },
                    "sending_queue": { "num_consumers": 1, "storage": "file_storage" },
                }),
            )
            .pipeline("logs", &["otlp"], &[], &["otlphttp"])
            .build()
            .unwrap()
    };

    // The backend is down: the batch is accepted, retried, then left in
    // storage when the agent stops.
    let first = Running::start(config(), 14421).await;
    assert_eq!(
        post(14421, "/v1/logs", logs(2).encode_to_vec()).await,
        reqwest::StatusCode::OK
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    first.stop().await;
    assert!(backend.bodies("/v1/logs").is_empty());

    backend.respond_with(200);
    let second = Running::start(config(), 14421).await;
    assert!(
        wait_until(Duration::from_secs(5), || backend.bodies("/v1/logs").len() == 1).await,
        "queued batch was not delivered after restart"
    );
    second.stop().await;

    let received = ExportLogsServiceRequest::decode(backend.bodies("/v1/logs")[0].as_ref()).unwrap();
    assert_eq!(received.resource_logs[0].scope_logs[0].log_records.len(), 2);
}
