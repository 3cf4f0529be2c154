//! Per-request correlation for proxy logs.
//!
//! Each request runs inside a `proxy_request` span carrying its trace ID,
//! method and path, so gate decisions, rewrites and backend errors can be
//! followed through the logs. The ID is taken from the caller's
//! `X-Trace-Id` header when present, forwarded to the engine, and echoed
//! on the response.

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use std::fmt;
use std::time::Instant;
use tracing::Instrument;

/// Header carrying the trace ID.
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Trace ID of the request being proxied, available as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    /// Reuses a non-empty, header-safe caller ID or generates a UUID v4.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(TRACE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(|| Self(uuid::Uuid::new_v4().to_string()), |s| Self(s.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Middleware wrapping each request in a `proxy_request` span.
pub async fn trace_id_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = TraceId::from_headers(request.headers());
    let span = tracing::info_span!(
        "proxy_request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    if let Some(value) = trace_id.header_value() {
        request.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    request.extensions_mut().insert(trace_id.clone());

    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;

    span.in_scope(|| {
        tracing::debug!(
            status = response.status().as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "request finished"
        );
    });
    if let Some(value) = trace_id.header_value() {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }

    response
}
