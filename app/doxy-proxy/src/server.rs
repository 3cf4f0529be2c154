//! Proxy server: listening socket lifecycle and connection loop.

use crate::api::{AppState, create_router};
use crate::error::{ProxyError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::fs::{DirBuilder, Permissions};
use std::future::Future;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tower::Service;
use tower_http::trace::TraceLayer;

/// Mode for the listening socket: any local user may talk to the proxy.
pub const SOCKET_MODE: u32 = 0o666;

/// Mode for a socket directory the proxy has to create.
pub const SOCKET_DIR_MODE: u32 = 0o777;

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket path clients connect to.
    pub socket_path: PathBuf,
}

/// Removes the socket file when dropped.
///
/// Owning the guard is what allows closing the socket, so removal happens
/// once however shutdown is reached.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(socket = %self.path.display(), "removed socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove socket {}: {}", self.path.display(), e),
        }
    }
}

/// Binds the listening socket at `path`.
///
/// Creates the parent directory if it is missing, replaces a stale socket
/// left by a previous run, and opens the socket to all local users.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, `path` exists and is
/// not a socket, or binding fails.
pub fn bind_socket(path: &Path) -> Result<(UnixListener, SocketGuard)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(SOCKET_DIR_MODE)
                .create(parent)?;
            // DirBuilder is subject to the umask.
            std::fs::set_permissions(parent, Permissions::from_mode(SOCKET_DIR_MODE))?;
        }
    }

    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path)?,
        Ok(_) => {
            return Err(ProxyError::Server(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| ProxyError::Server(format!("failed to bind {}: {e}", path.display())))?;
    let guard = SocketGuard {
        path: path.to_path_buf(),
    };
    std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))?;

    Ok((listener, guard))
}

/// Docker API proxy server.
pub struct ProxyServer {
    config: ServerConfig,
    state: AppState,
}

impl ProxyServer {
    /// Creates a new proxy server.
    #[must_use]
    pub const fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Returns the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Runs the server until `shutdown` resolves.
    ///
    /// Each connection is served on its own task. On shutdown the listener
    /// is closed and the socket file removed; in-flight requests are not
    /// waited for.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or accepting fails.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (listener, guard) = bind_socket(&self.config.socket_path)?;

        tracing::info!(
            backend = self.state.policy.name(),
            patterns = self.state.policy.allowed().len(),
            gpu = self.state.policy.gpu_enabled(),
            "Proxy listening on {}",
            guard.path().display()
        );

        let app = create_router(self.state.clone()).layer(TraceLayer::new_for_http());
        tokio::pin!(shutdown);

        loop {
            let stream = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(|e| ProxyError::Server(e.to_string()))?;
                    stream
                }
            };

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .with_upgrades()
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("shutting down")
                        && !err_str.contains("connection reset")
                        && !err_str.contains("broken pipe")
                    {
                        tracing::error!("Error serving connection: {}", err);
                    }
                }
            });
        }

        tracing::info!("Shutting down, closing {}", guard.path().display());
        drop(listener);
        drop(guard);
        Ok(())
    }
}
