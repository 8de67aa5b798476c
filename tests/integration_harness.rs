//! Workspace-level scenarios running the built-in agent components together
//! with the pipeline runtime.
//!
//! Each test drives one behavior end to end: fan-out to several exporters,
//! copy-on-share with a mutating processor, sending queue overflow,
//! crash recovery of a file backed queue, cycle rejection across connectors
//! and shutdown ordering.

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::http::{StatusCode, Uri};
use otel_agent::config::{ConfigBuilder, defaults};
use otel_agent::connector::CountConnectorFactory;
use otel_agent::extension::{FileStorage, FileStorageConfig};
use otel_agent::processor::ResourceProcessorFactory;
use otel_agent::{AgentError, Runtime};
use otel_agent_pdata::proto::collector::trace::v1::ExportTraceServiceRequest;
use otel_agent_pdata::proto::trace::v1::{ResourceSpans, ScopeSpans, Span};
use otel_agent_pdata::{Batch, Logs};
use otel_agent_pipeline::component::{BuildInfo, CreateSettings, Kind};
use otel_agent_pipeline::queue::{QueueConfig, QueueSettings, send_fn};
use otel_agent_pipeline::testing::{
    Recorder, StaticHost, TestFactories, logs_with_records, traces_with_spans,
};
use otel_agent_pipeline::{
    Component, ComponentId, ConsumeError, Consumer, Context, Export, ExporterHelper, GraphError,
    HelperConfig, PersistentQueue, Queue, RetryConfig, Service,
};
use prost::Message;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};

async fn wait_for_http_ready(port: u16, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    let url = format!("http://127.0.0.1:{}/health", port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

    while Instant::now() < deadline {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    Err(format!(
        "HTTP server health check timed out after {:?} on port {}",
        timeout, port
    ))
}

/// Starts an OTLP/HTTP backend on an ephemeral port that records trace
/// request bodies.
async fn start_backend() -> (SocketAddr, Arc<Mutex<Vec<Bytes>>>) {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&bodies);
    let app = Router::new().fallback(move |uri: Uri, body: Bytes| {
        let recorded = Arc::clone(&recorded);
        async move {
            if uri.path() == "/v1/traces" {
                recorded.lock().unwrap().push(body);
            }
            StatusCode::OK
        }
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, bodies)
}

fn span_count(bodies: &Mutex<Vec<Bytes>>) -> usize {
    bodies
        .lock()
        .unwrap()
        .iter()
        .map(|body| {
            ExportTraceServiceRequest::decode(body.as_ref())
                .unwrap()
                .resource_spans
                .iter()
                .flat_map(|rs| &rs.scope_spans)
                .map(|ss| ss.spans.len())
                .sum::<usize>()
        })
        .sum()
}

#[tokio::test]
async fn one_receiver_feeds_two_exporters() {
    let (primary_addr, primary) = start_backend().await;
    let (backup_addr, backup) = start_backend().await;

    let exporter = |addr: SocketAddr| {
        json!({
            "endpoint": format!("http://{addr}"),
            "compression": "none",
            "sending_queue": { "enabled": false },
        })
    };
    let config = ConfigBuilder::new()
        .receiver("otlp", json!({ "endpoint": "127.0.0.1:14518" }))
        .exporter("otlphttp/primary", exporter(primary_addr))
        .exporter("otlphttp/backup", exporter(backup_addr))
        .pipeline("traces", &["otlp"], &[], &["otlphttp/primary", "otlphttp/backup"])
        .build()
        .unwrap();

    let runtime = Runtime::new(config).unwrap();
    let token = runtime.cancellation_token();
    let handle = tokio::spawn(runtime.run());
    wait_for_http_ready(14518, Duration::from_secs(5))
        .await
        .expect("Receiver failed to start");

    let request = ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans: (0..3)
                    .map(|i| Span {
                        name: format!("span-{i}"),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    };
    let response = reqwest::Client::new()
        .post("http://127.0.0.1:14518/v1/traces")
        .header("Content-Type", "application/x-protobuf")
        .body(request.encode_to_vec())
        .send()
        .await
        .expect("Failed to send request");

    // Without a sending queue the response waits for both exports.
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(primary.lock().unwrap().len(), 1);
    assert_eq!(backup.lock().unwrap().len(), 1);
    assert_eq!(span_count(&primary) + span_count(&backup), 6);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runtime did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn mutating_pipeline_does_not_leak_into_reader() {
    let test = TestFactories::new(Recorder::default());
    let mut factories = test.factories();
    factories
        .processors
        .register(Arc::new(ResourceProcessorFactory))
        .unwrap();

    let config = ConfigBuilder::new()
        .receiver("testrcv", defaults())
        .processor(
            "resource",
            json!({ "attributes": [
                { "key": "deployment.environment", "value": "prod", "action": "insert" }
            ] }),
        )
        .exporter("testexp/mutated", defaults())
        .exporter("testexp/plain", defaults())
        .pipeline("traces/mutated", &["testrcv"], &["resource"], &["testexp/mutated"])
        .pipeline("traces/plain", &["testrcv"], &[], &["testexp/plain"])
        .build()
        .unwrap();

    let service = Service::new(BuildInfo::default(), &config, &factories).unwrap();
    service.start().await.unwrap();
    test.receivers
        .traces("testrcv")
        .unwrap()
        .consume(&Context::background(), traces_with_spans(2))
        .await
        .unwrap();
    service.shutdown().await.unwrap();

    let attribute_keys = |id: &str| -> Vec<String> {
        let sink = test.exporters.traces(id).unwrap();
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        batches[0].request().resource_spans[0]
            .resource
            .as_ref()
            .map(|r| r.attributes.iter().map(|kv| kv.key.clone()).collect())
            .unwrap_or_default()
    };
    assert_eq!(attribute_keys("testexp/mutated"), vec!["deployment.environment"]);
    assert!(attribute_keys("testexp/plain").is_empty());
}

/// Export blocked until the test hands out permits.
struct Gated {
    gate: Semaphore,
}

#[async_trait]
impl Export<Logs> for Gated {
    async fn export(&self, _ctx: &Context, _batch: &Logs) -> Result<(), ConsumeError> {
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        Ok(())
    }
}

#[tokio::test]
async fn sending_queue_overflow_rejects_then_recovers() {
    let gated = Arc::new(Gated {
        gate: Semaphore::new(0),
    });
    let settings = CreateSettings::new(
        "otlphttp".parse().unwrap(),
        Kind::Exporter,
        BuildInfo::default(),
    );
    let config = HelperConfig {
        timeout: Duration::ZERO,
        retry_on_failure: RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        },
        sending_queue: QueueConfig {
            enabled: true,
            num_consumers: 1,
            queue_size: 5,
            storage: None,
        },
    };
    let exporter = ExporterHelper::new(&settings, &config, gated.clone()).unwrap();
    exporter.start(&StaticHost::new()).await.unwrap();
    let ctx = Context::background();

    let mut accepted = 0;
    for _ in 0..10 {
        match exporter.consume(&ctx, logs_with_records(1)).await {
            Ok(()) => accepted += 1,
            Err(e) => assert!(e.is_queue_full(), "unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(exporter.counters().enqueue_failed_items(), 5);

    // One send completes and frees exactly one slot.
    gated.gate.add_permits(1);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if exporter.counters().sent_items() == 1
            && exporter.consume(&ctx, logs_with_records(1)).await.is_ok()
        {
            break;
        }
        assert!(Instant::now() < deadline, "no slot was freed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(exporter.consume(&ctx, logs_with_records(1)).await.is_err());

    gated.gate.add_permits(100);
    exporter.shutdown().await.unwrap();
    assert_eq!(exporter.counters().sent_items(), 6);
}

fn storage_id() -> ComponentId {
    "file_storage".parse().unwrap()
}

async fn file_host(directory: &std::path::Path) -> StaticHost {
    let storage = FileStorage::new(FileStorageConfig {
        directory: directory.to_path_buf(),
        create_directory: true,
    });
    storage.start(&StaticHost::new()).await.unwrap();
    StaticHost::new().with_extension(storage_id(), Arc::new(storage))
}

fn file_queue(
    workers: usize,
    deliveries: mpsc::UnboundedSender<usize>,
    block: bool,
) -> PersistentQueue<Logs> {
    let send = send_fn(move |_ctx: Context, batch: Logs| {
        let deliveries = deliveries.clone();
        async move {
            let _ = deliveries.send(batch.item_count());
            if block {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    });
    PersistentQueue::new(
        100,
        workers,
        storage_id(),
        QueueSettings {
            owner: "otlphttp".parse().unwrap(),
            kind: Kind::Exporter,
            send,
            on_drop: None,
        },
    )
}

async fn receive(rx: &mut mpsc::UnboundedReceiver<usize>, n: usize) -> Vec<usize> {
    let mut received = Vec::with_capacity(n);
    for _ in 0..n {
        let count = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("sender dropped");
        received.push(count);
    }
    received
}

#[tokio::test]
async fn file_backed_queue_recovers_after_crash() {
    let dir = tempfile::TempDir::new().unwrap();

    // Three workers claim the first three items and never finish.
    let (stuck_tx, mut stuck_rx) = mpsc::unbounded_channel();
    let crashed = file_queue(3, stuck_tx, true);
    crashed.start(&file_host(dir.path()).await).await.unwrap();
    for records in 1..=10 {
        crashed
            .offer(&Context::background(), logs_with_records(records))
            .await
            .unwrap();
    }
    let mut claimed = receive(&mut stuck_rx, 3).await;
    claimed.sort_unstable();
    assert_eq!(claimed, vec![1, 2, 3]);

    // The crashed instance is abandoned; a new process opens the same files.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let restarted = file_queue(1, tx, false);
    restarted.start(&file_host(dir.path()).await).await.unwrap();

    let delivered = receive(&mut rx, 10).await;
    assert_eq!(&delivered[..7], &[4, 5, 6, 7, 8, 9, 10]);
    let mut tail = delivered[7..].to_vec();
    tail.sort_unstable();
    assert_eq!(tail, vec![1, 2, 3]);
    restarted.shutdown().await.unwrap();
}

#[test]
fn connector_cycle_is_rejected() {
    let test = TestFactories::new(Recorder::default());
    let mut factories = test.factories();
    factories
        .connectors
        .register(Arc::new(CountConnectorFactory))
        .unwrap();

    // traces -> count -> metrics -> testconn -> traces
    let config = ConfigBuilder::new()
        .receiver("testrcv", defaults())
        .connector("count", defaults())
        .connector("testconn", defaults())
        .pipeline("traces", &["testrcv", "testconn"], &[], &["count"])
        .pipeline("metrics", &["count"], &[], &["testconn"])
        .build()
        .unwrap();

    let err = Service::new(BuildInfo::default(), &config, &factories).unwrap_err();
    assert!(matches!(err, GraphError::Cycle(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn shutdown_runs_in_order_and_reports_failures() {
    let recorder = Recorder::default();
    let test = TestFactories::new(recorder.clone());
    let config = ConfigBuilder::new()
        .receiver("testrcv", defaults())
        .processor("testproc", json!({ "fail_shutdown": true }))
        .exporter("testexp", defaults())
        .pipeline("logs", &["testrcv"], &["testproc"], &["testexp"])
        .build()
        .unwrap();

    let runtime = Runtime::with_factories(config, test.factories());
    let token = runtime.cancellation_token();
    let handle = tokio::spawn(runtime.run());
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.count("start receiver testrcv") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("service did not start");
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("runtime did not stop")
        .unwrap();
    assert!(matches!(result, Err(AgentError::Graph(_))));
    assert_eq!(
        recorder.events_with_prefix("shutdown"),
        vec![
            "shutdown receiver testrcv",
            "shutdown processor testproc",
            "shutdown exporter testexp",
        ]
    );
}
