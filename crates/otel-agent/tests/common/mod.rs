//! Shared test utilities for the agent integration tests.

#![allow(dead_code)]

use axum::Router;
use axum::body::Bytes;
use axum::http::{StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Polls an HTTP health endpoint until it responds successfully.
///
/// Preferred over fixed sleeps when waiting for a receiver to come up.
pub async fn wait_for_http_ready(port: u16, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now() + timeout;
    let url = format!("http://127.0.0.1:{}/health", port);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

    while Instant::now() < deadline {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                return Ok(());
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    Err(format!(
        "HTTP server health check timed out after {:?} on port {}",
        timeout, port
    ))
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// An OTLP/HTTP backend recording every request body by path.
#[derive(Clone)]
pub struct Backend {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<(String, Bytes)>>>,
    status: Arc<AtomicU16>,
}

impl Backend {
    /// Starts a backend answering 200 on an ephemeral port.
    pub async fn start() -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(AtomicU16::new(200));
        let backend = Self {
            addr: "127.0.0.1:0".parse().unwrap(),
            requests,
            status,
        };
        let recorded = backend.clone();
        let app = Router::new().fallback(move |uri: Uri, body: Bytes| {
            let recorded = recorded.clone();
            async move {
                let status = recorded.status.load(Ordering::SeqCst);
                if status == 200 {
                    recorded
                        .requests
                        .lock()
                        .unwrap()
                        .push((uri.path().to_string(), body));
                }
                StatusCode::from_u16(status).unwrap()
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, ..backend }
    }

    /// Base URL for an exporter's `endpoint`.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Makes the backend answer `status` without recording.
    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Bodies received on `path`, in arrival order.
    pub fn bodies(&self, path: &str) -> Vec<Bytes> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }
}
