//! Request pipeline.
//!
//! Every request goes through the same states:
//!
//! ```text
//! Received ─► Gated ─┬─► Rejected (403, backend never contacted)
//!                    └─► Rewritten | PassThrough ─► Dispatched ─► Responded
//! ```
//!
//! The allow-list gate runs before the body is read, so rejected requests
//! never pay for buffering or rewriting. Only container-creation bodies are
//! buffered; everything else streams straight through.

use crate::error::{ProxyError, Result};
use crate::policy::ProxyPolicy;
use crate::proxy::{self, Dispatcher};
use crate::rewrite;
use crate::trace::trace_id_middleware;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, header};
use axum::response::Response;
use axum::{Router, middleware};
use http_body_util::LengthLimitError;
use std::sync::Arc;

/// Upper bound for container-creation bodies buffered for rewriting.
pub const REWRITE_BUFFER_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// Application state shared with the handler.
#[derive(Clone)]
pub struct AppState {
    /// Immutable instance policy.
    pub policy: Arc<ProxyPolicy>,
    /// Backend dispatcher.
    pub dispatcher: Dispatcher,
}

impl AppState {
    #[must_use]
    pub fn new(policy: ProxyPolicy, dispatcher: Dispatcher) -> Self {
        Self {
            policy: Arc::new(policy),
            dispatcher,
        }
    }
}

/// Creates the proxy router.
///
/// There are no per-endpoint routes: the allow-list decides what reaches
/// the backend, so a single fallback handler serves every path.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(middleware::from_fn(trace_id_middleware))
        .with_state(state)
}

/// Gates, optionally rewrites and forwards one request.
///
/// # Errors
///
/// Returns [`ProxyError::Forbidden`] for paths outside the allow-list,
/// [`ProxyError::InvalidBody`] for undecodable create bodies,
/// [`ProxyError::PayloadTooLarge`] for create bodies over
/// [`REWRITE_BUFFER_LIMIT_BYTES`], and backend
/// errors from dispatch.
pub async fn handle_request(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response> {
    state.policy.check_path(req.uri().path())?;

    if proxy::wants_upgrade(req.headers()) {
        return state.dispatcher.forward_upgrade(req).await;
    }

    if !rewrite::is_container_create(req.method(), req.uri().path()) {
        return state.dispatcher.forward(req).await;
    }

    let req = rewrite_request(req, &state.policy).await?;
    state.dispatcher.forward(req).await
}

/// Buffers and rewrites a container-creation request.
///
/// `Content-Length` is recomputed from the bytes that will be sent, whether
/// the body was rewritten or passed through.
async fn rewrite_request(req: Request<Body>, policy: &ProxyPolicy) -> Result<Request<Body>> {
    let (mut parts, body) = req.into_parts();
    let original = axum::body::to_bytes(body, REWRITE_BUFFER_LIMIT_BYTES)
        .await
        .map_err(|e| {
            let inner = e.into_inner();
            if inner.is::<LengthLimitError>() {
                ProxyError::PayloadTooLarge(format!(
                    "container create body exceeds {REWRITE_BUFFER_LIMIT_BYTES} bytes"
                ))
            } else {
                ProxyError::InvalidBody(format!("failed to read request body: {inner}"))
            }
        })?;

    let body = match rewrite::rewrite_body(&original, policy)? {
        Some(rewritten) => {
            parts
                .headers
                .insert(header::CONTENT_LENGTH, rewritten.content_length());
            if !parts.headers.contains_key(header::CONTENT_TYPE) {
                parts
                    .headers
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            rewritten.into_bytes()
        }
        None => {
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(original.len()));
            original
        }
    };
    parts.headers.remove(header::TRANSFER_ENCODING);

    Ok(Request::from_parts(parts, Body::from(body)))
}
