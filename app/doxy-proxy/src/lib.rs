//! # doxy-proxy
//!
//! Filtering and rewriting proxy for the Docker Engine API.
//!
//! The proxy listens on its own Unix socket and forwards requests to the
//! engine's control socket. Before anything reaches the engine:
//!
//! - the request path must match an allow-list pattern, otherwise the proxy
//!   answers `403` itself;
//! - container-creation bodies get host-specific bind mounts and device
//!   mappings appended (optionally the GPU driver tree and device nodes).
//!
//! Everything else is forwarded verbatim and the response is streamed back
//! unmodified.
//!
//! ## Architecture
//!
//! ```text
//! docker CLI ──► Unix Socket ──► doxy-proxy ──► /var/run/docker.sock
//!                                    │
//!                       gate ─► rewrite ─► dispatch
//! ```
//!
//! ## Usage
//!
//! ```bash
//! doxy-daemon --socket /tmp/doxy/docker.sock \
//!     --pattern '^(/v[0-9.]+)?/containers/create$' --gpu
//! DOCKER_HOST=unix:///tmp/doxy/docker.sock docker run --rm alpine true
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod connector;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod rewrite;
pub mod server;
pub mod trace;
pub mod types;

pub use api::{AppState, create_router};
pub use config::ProxyConfig;
pub use connector::BackendConnector;
pub use error::{ProxyError, Result};
pub use policy::ProxyPolicy;
pub use proxy::Dispatcher;
pub use server::{ProxyServer, ServerConfig};
