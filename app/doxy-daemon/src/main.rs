use anyhow::{Context, Result};
use clap::Parser;
use doxy_proxy::{AppState, ProxyConfig, ProxyServer, ServerConfig};
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "doxy-daemon")]
#[command(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Configuration file (default: /etc/doxy/config.toml and ~/.config/doxy/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Unix socket path the proxy listens on.
    #[arg(long, alias = "proxy-socket")]
    pub socket: Option<PathBuf>,

    /// Docker engine socket requests are forwarded to.
    #[arg(long, alias = "docker-socket")]
    pub backend_socket: Option<PathBuf>,

    /// File with one allowed path pattern per line.
    #[arg(long)]
    pub pattern_file: Option<PathBuf>,

    /// Allowed path pattern (repeatable, evaluated in order).
    #[arg(long = "pattern")]
    pub patterns: Vec<String>,

    /// Comma separated bind mounts added to every created container.
    #[arg(long, value_delimiter = ',')]
    pub bind_mounts: Vec<String>,

    /// Comma separated device mappings (host:container:perm) added to every created container.
    #[arg(long, value_delimiter = ',')]
    pub devices: Vec<String>,

    /// Expose the GPU driver and device nodes to created containers.
    #[arg(long)]
    pub gpu: bool,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

impl DaemonArgs {
    /// Applies command line overrides on top of the loaded configuration.
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(backend) = self.backend_socket {
            config.backend_socket = backend;
        }
        if let Some(file) = self.pattern_file {
            config.pattern_file = Some(file);
        }
        if !self.patterns.is_empty() {
            config.allowed_patterns = self.patterns;
        }
        if !self.bind_mounts.is_empty() {
            config.bind_mounts = self.bind_mounts;
        }
        if !self.devices.is_empty() {
            config.device_mappings = self.devices;
        }
        if self.gpu {
            config.gpu = true;
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let mut config = match &args.config {
        Some(path) => ProxyConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ProxyConfig::load().context("Failed to load config")?,
    };
    args.apply(&mut config);

    let level = config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("doxy_proxy={level},doxy_daemon={level},tower_http=warn").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(config).await
}

async fn run(config: ProxyConfig) -> Result<()> {
    info!("Starting doxy proxy...");

    let policy = config.policy().context("Failed to build proxy policy")?;
    if policy.allowed().is_empty() {
        tracing::warn!("No allow-list patterns configured, every request will be rejected");
    }
    info!(
        patterns = ?policy.allowed().patterns().collect::<Vec<_>>(),
        bind_mounts = ?policy.bind_mounts(),
        devices = ?policy.device_mappings(),
        gpu = policy.gpu_enabled(),
        "Policy loaded"
    );

    let dispatcher = config.dispatcher();
    let backend = dispatcher.connector().socket_path().to_path_buf();
    let state = AppState::new(policy, dispatcher);
    let server = ProxyServer::new(
        ServerConfig {
            socket_path: config.socket_path.clone(),
        },
        state,
    );
    info!(
        socket = %server.socket_path().display(),
        backend = %backend.display(),
        "Proxy configured"
    );

    server
        .run(shutdown_signal())
        .await
        .with_context(|| format!("Proxy server on {} failed", config.socket_path.display()))?;

    info!("doxy proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Caught SIGINT, shutting down"),
        () = terminate => info!("Caught SIGTERM, shutting down"),
    }
}
