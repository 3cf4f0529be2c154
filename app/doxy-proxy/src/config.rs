//! Configuration management.
//!
//! Configuration is loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`DOXY_*`, nested keys separated by `__`)
//! 2. Configuration file (`~/.config/doxy/config.toml`, or an explicit path)
//! 3. System configuration file (`/etc/doxy/config.toml`)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! socket_path = "/tmp/doxy/docker.sock"
//! backend_socket = "/var/run/docker.sock"
//! allowed_patterns = ["^(/v[0-9.]+)?/containers/create$", "^(/v[0-9.]+)?/_ping$"]
//! pattern_file = "/etc/doxy/patterns"
//! bind_mounts = ["/data:/data:ro"]
//! device_mappings = ["/dev/fuse:/dev/fuse:rwm"]
//! gpu = false
//!
//! [timeouts]
//! connect_secs = 10
//! response_secs = 0
//!
//! [logging]
//! level = "info"
//! ```

use crate::connector::BackendConnector;
use crate::error::{ProxyError, Result};
use crate::policy::ProxyPolicy;
use crate::proxy::Dispatcher;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Socket clients connect to.
    pub socket_path: PathBuf,
    /// Backend engine socket requests are forwarded to.
    pub backend_socket: PathBuf,
    /// Allow-list patterns, in evaluation order.
    pub allowed_patterns: Vec<String>,
    /// File with one pattern per line, evaluated after `allowed_patterns`.
    pub pattern_file: Option<PathBuf>,
    /// Bind mounts injected into every created container.
    pub bind_mounts: Vec<String>,
    /// Device mappings (`host:container:perm`) injected into every created container.
    pub device_mappings: Vec<String>,
    /// Inject the GPU driver mount, device nodes and `PATH`.
    pub gpu: bool,
    /// Backend deadlines.
    pub timeouts: TimeoutConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/doxy/docker.sock"),
            backend_socket: PathBuf::from("/var/run/docker.sock"),
            allowed_patterns: Vec::new(),
            pattern_file: None,
            bind_mounts: Vec::new(),
            device_mappings: Vec::new(),
            gpu: false,
            timeouts: TimeoutConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from the system and user files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()))
            .merge(Toml::file(user_config_path()))
            .merge(Env::prefixed("DOXY_").split("__"))
            .extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DOXY_").split("__"))
            .extract()
    }

    /// Returns inline patterns followed by those read from `pattern_file`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] if the pattern file cannot be read.
    pub fn patterns(&self) -> Result<Vec<String>> {
        let mut patterns = self.allowed_patterns.clone();
        if let Some(path) = &self.pattern_file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ProxyError::Config(format!("failed to read pattern file {}: {e}", path.display()))
            })?;
            patterns.extend(parse_pattern_file(&content));
        }
        Ok(patterns)
    }

    /// Builds the immutable instance policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern file cannot be read.
    pub fn policy(&self) -> Result<ProxyPolicy> {
        Ok(ProxyPolicy::new(
            self.backend_socket.to_string_lossy(),
            &self.patterns()?,
            self.bind_mounts.clone(),
            self.device_mappings.clone(),
            self.gpu,
        ))
    }

    /// Builds the dispatcher for the backend socket.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        let connector = BackendConnector::new(&self.backend_socket)
            .with_connect_timeout(self.timeouts.connect());
        Dispatcher::new(connector).with_response_timeout(self.timeouts.response())
    }
}

/// Parses a pattern file: one pattern per line, blank lines and `#` comments skipped.
#[must_use]
pub fn parse_pattern_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Backend deadlines. Zero disables a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit for connecting to the backend socket.
    pub connect_secs: u64,
    /// Limit for receiving response headers from the backend.
    ///
    /// Off by default: endpoints like `/containers/{id}/wait` only answer
    /// once the container exits.
    pub response_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            response_secs: 0,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn connect(&self) -> Option<Duration> {
        secs(self.connect_secs)
    }

    #[must_use]
    pub const fn response(&self) -> Option<Duration> {
        secs(self.response_secs)
    }
}

const fn secs(value: u64) -> Option<Duration> {
    if value == 0 {
        None
    } else {
        Some(Duration::from_secs(value))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/doxy/config.toml")
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("doxy")
        .join("config.toml")
}
