//! Backend socket connector.

use crate::error::{ProxyError, Result};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

/// Opens connections to the backend engine's Unix socket.
///
/// Every outbound request gets a fresh connection; nothing is pooled.
#[derive(Debug, Clone)]
pub struct BackendConnector {
    socket_path: PathBuf,
    connect_timeout: Option<Duration>,
}

impl BackendConnector {
    /// Creates a connector for the socket at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: None,
        }
    }

    /// Bounds how long a single connect attempt may take.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Connects to the backend socket.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Backend`] if the socket cannot be reached and
    /// [`ProxyError::Timeout`] if the connect deadline expires.
    pub async fn connect(&self) -> Result<TokioIo<UnixStream>> {
        let connect = UnixStream::connect(&self.socket_path);
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                ProxyError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.socket_path.display(),
                    limit
                ))
            })?,
            None => connect.await,
        }
        .map_err(|e| {
            ProxyError::Backend(format!(
                "failed to connect to {}: {e}",
                self.socket_path.display()
            ))
        })?;

        tracing::trace!(socket = %self.socket_path.display(), "connected to backend");
        Ok(TokioIo::new(stream))
    }
}
