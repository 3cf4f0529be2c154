//! Mock Docker engine served on a temporary Unix socket.

#![allow(dead_code)]

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use bytes::Bytes;
use doxy_proxy::{AppState, BackendConnector, Dispatcher, ProxyPolicy};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;

/// A request as the backend saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Received {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("backend received JSON")
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

pub struct MockBackend {
    _dir: TempDir,
    path: PathBuf,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockBackend {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn last(&self) -> Received {
        self.received().pop().expect("backend received a request")
    }

    pub fn state(&self, policy: ProxyPolicy) -> AppState {
        state_at(self.path(), policy, None)
    }
}

/// Builds proxy state forwarding to the socket at `path`.
pub fn state_at(path: &Path, policy: ProxyPolicy, response_timeout: Option<Duration>) -> AppState {
    let connector =
        BackendConnector::new(path).with_connect_timeout(Some(Duration::from_secs(5)));
    AppState::new(
        policy,
        Dispatcher::new(connector).with_response_timeout(response_timeout),
    )
}

/// Starts a backend that accepts connections but never answers.
pub async fn spawn_silent_backend() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("docker.sock");
    let listener = UnixListener::bind(&path).expect("Failed to bind silent backend");

    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    (dir, path)
}

/// Starts a backend that records every request and answers like dockerd.
pub async fn spawn_backend() -> MockBackend {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("docker.sock");
    let listener = UnixListener::bind(&path).expect("Failed to bind mock backend");

    let connections = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));

    let conn_count = Arc::clone(&connections);
    let log = Arc::clone(&received);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            conn_count.fetch_add(1, Ordering::SeqCst);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                    let log = Arc::clone(&log);
                    async move { record(req, &log).await }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    MockBackend {
        _dir: dir,
        path,
        connections,
        received,
    }
}

async fn record(
    req: Request<Incoming>,
    log: &Mutex<Vec<Received>>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    log.lock().unwrap().push(Received {
        method: parts.method.clone(),
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body,
    });

    let (status, payload): (StatusCode, &'static [u8]) = if parts.method == Method::POST {
        (StatusCode::CREATED, br#"{"Id":"4fa6e0f0c678","Warnings":[]}"#)
    } else {
        (StatusCode::OK, b"OK")
    };
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(payload)))
        .unwrap())
}

pub fn policy(patterns: &[&str], binds: &[&str], devices: &[&str], gpu: bool) -> ProxyPolicy {
    ProxyPolicy::new(
        "/var/run/docker.sock",
        patterns,
        binds.iter().map(ToString::to_string).collect(),
        devices.iter().map(ToString::to_string).collect(),
        gpu,
    )
}
