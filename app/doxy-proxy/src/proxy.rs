//! Reverse dispatch to the backend engine.
//!
//! Each admitted request is sent over a fresh HTTP/1.1 connection to the
//! backend socket. The request target is rewritten to the logical
//! `http://docker` authority while path and query are kept byte-for-byte.
//! Responses are streamed back lazily, so fixed-length, chunked (logs,
//! events) and upgraded (attach, exec) exchanges all pass through.

use crate::connector::BackendConnector;
use crate::error::{ProxyError, Result};
use axum::body::Body;
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, header};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::time::Duration;

/// Logical host name the backend sees in the request target.
pub const BACKEND_AUTHORITY: &str = "docker";

/// Headers that describe a single hop and are never forwarded as-is.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Rewrites `uri` to target the backend's logical authority.
///
/// # Errors
///
/// Returns [`ProxyError::Server`] if the resulting URI is not valid.
pub fn backend_uri(uri: &Uri) -> Result<Uri> {
    let path_and_query = uri.path_and_query().map_or("/", PathAndQuery::as_str);
    Uri::builder()
        .scheme("http")
        .authority(BACKEND_AUTHORITY)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Server(format!("failed to build backend uri: {e}")))
}

/// Returns true if the request asks for a protocol upgrade.
#[must_use]
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.get(header::UPGRADE).is_some()
        || headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::HOST || name.as_str() == "keep-alive" || HOP_BY_HOP.contains(name)
}

/// Removes headers that only described the backend hop from a response,
/// including any the backend listed in its `Connection` header.
fn strip_response_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn into_client_response(response: hyper::Response<Incoming>) -> Response<Body> {
    let (mut parts, incoming) = response.into_parts();
    strip_response_hop_headers(&mut parts.headers);
    Response::from_parts(parts, Body::new(incoming))
}

/// Forwards requests to the backend socket.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    connector: BackendConnector,
    response_timeout: Option<Duration>,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(connector: BackendConnector) -> Self {
        Self {
            connector,
            response_timeout: None,
        }
    }

    /// Bounds the wait for response headers. Response bodies are not limited.
    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn connector(&self) -> &BackendConnector {
        &self.connector
    }

    /// Forwards a request and streams the backend response back.
    ///
    /// The request body is relayed as given; callers that rewrite it must set
    /// `Content-Length` to match. Exactly one attempt is made.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting, the handshake or the exchange fails.
    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>> {
        let mut sender = self.handshake().await?;
        let backend_req = backend_request(req, false)?;

        let response = self.await_response(sender.send_request(backend_req)).await?;
        Ok(into_client_response(response))
    }

    /// Forwards a request that asks for a protocol upgrade.
    ///
    /// If the backend answers `101 Switching Protocols`, both upgraded
    /// connections are bridged in the background. Otherwise the backend
    /// response is returned as-is.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting, the handshake, the exchange or the
    /// upgrade response construction fails.
    pub async fn forward_upgrade(&self, mut client_req: Request<Body>) -> Result<Response<Body>> {
        let mut sender = self.handshake().await?;

        // The client request stays behind: its extensions carry the upgrade.
        let mut forwarded = Request::new(std::mem::take(client_req.body_mut()));
        *forwarded.method_mut() = client_req.method().clone();
        *forwarded.uri_mut() = client_req.uri().clone();
        *forwarded.headers_mut() = client_req.headers().clone();
        let backend_req = backend_request(forwarded, true)?;

        let backend_response = self.await_response(sender.send_request(backend_req)).await?;
        if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(into_client_response(backend_response));
        }

        // Raw vs multiplexed stream is signalled through the content type.
        let content_type = backend_response.headers().get(header::CONTENT_TYPE).cloned();
        let upgrade = backend_response
            .headers()
            .get(header::UPGRADE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("tcp"));

        let client_upgrade = hyper::upgrade::on(&mut client_req);
        let backend_upgrade = hyper::upgrade::on(backend_response);

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, upgrade);
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        let response = builder
            .body(Body::empty())
            .map_err(|e| ProxyError::Server(format!("failed to build upgrade response: {e}")))?;

        tokio::spawn(async move {
            let (client_io, backend_io) = match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!("upgrade bridging setup failed: {}", e);
                    return;
                }
            };
            let mut client_io = TokioIo::new(client_io);
            let mut backend_io = TokioIo::new(backend_io);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
                let err = ProxyError::from(e);
                if !err.is_disconnect() {
                    tracing::debug!("upgrade bridge error: {}", err);
                }
            }
        });

        Ok(response)
    }

    async fn handshake(&self) -> Result<http1::SendRequest<Body>> {
        let io = self.connector.connect().await?;
        let (sender, conn) = http1::Builder::new()
            .handshake(io)
            .await
            .map_err(|e| ProxyError::Backend(format!("backend handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                let msg = e.to_string().to_lowercase();
                if !msg.contains("canceled") && !msg.contains("incomplete") {
                    tracing::debug!("backend connection ended: {}", e);
                }
            }
        });

        Ok(sender)
    }

    async fn await_response<F>(&self, send: F) -> Result<hyper::Response<Incoming>>
    where
        F: Future<Output = hyper::Result<hyper::Response<Incoming>>>,
    {
        let result = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, send).await.map_err(|_| {
                ProxyError::Timeout(format!("no response from backend within {limit:?}"))
            })?,
            None => send.await,
        };
        result.map_err(|e| ProxyError::Backend(format!("backend request failed: {e}")))
    }
}

/// Builds the backend request in origin form with the logical `Host`.
fn backend_request(req: Request<Body>, upgrade: bool) -> Result<Request<Body>> {
    let (parts, body) = req.into_parts();
    let target = backend_uri(&parts.uri)?;
    let origin = target.path_and_query().map_or("/", PathAndQuery::as_str);

    let mut backend_req = Request::builder()
        .method(parts.method)
        .uri(origin)
        .body(body)
        .map_err(|e| ProxyError::Server(format!("failed to build backend request: {e}")))?;

    let headers = backend_req.headers_mut();
    for (name, value) in &parts.headers {
        let keep = !is_hop_by_hop(name)
            || (upgrade && (name == header::CONNECTION || name == header::UPGRADE));
        if keep {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(header::HOST, HeaderValue::from_static(BACKEND_AUTHORITY));
    if !upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    Ok(backend_req)
}
