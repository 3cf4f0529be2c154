//! Per-instance proxy policy and the allow-list gate.
//!
//! A [`ProxyPolicy`] is built once at startup and shared read-only by every
//! request task.
//!
//! # Gate evaluation
//!
//! Patterns are tried in configured order and the first one that matches the
//! request path admits it. A path no pattern matches is rejected with
//! [`ProxyError::Forbidden`] before the body is read.
//!
//! Patterns are unanchored regular expressions, so `^/containers/create$`
//! and `/containers/create` behave differently on versioned paths such as
//! `/v1.43/containers/create`.

use crate::error::{ProxyError, Result};
use regex::Regex;

/// Host directory holding the GPU user-space driver, mounted into containers.
pub const GPU_DRIVER_BIND: &str =
    "/var/lib/nvidia-docker/volumes/nvidia_driver/384.81/:/usr/local/nvidia/";

/// GPU device nodes exposed when GPU support is enabled.
pub const GPU_DEVICES: [&str; 4] = [
    "/dev/nvidia0:/dev/nvidia0:rwm",
    "/dev/nvidia-uvm:/dev/nvidia-uvm:rwm",
    "/dev/nvidia-uvm-tools:/dev/nvidia-uvm-tools:rwm",
    "/dev/nvidiactl:/dev/nvidiactl:rwm",
];

/// `PATH` entry putting the GPU toolkit binaries first.
pub const GPU_PATH_ENV: &str =
    "PATH=/usr/local/nvidia/bin:/usr/local/cuda/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Ordered set of compiled path patterns.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    patterns: Vec<Regex>,
}

impl AllowList {
    /// Compiles the given patterns, dropping any that fail to parse.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                let p = p.as_ref();
                match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::warn!(pattern = p, error = %e, "dropping invalid allow-list pattern");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// Returns the index of the first pattern matching `path`.
    #[must_use]
    pub fn first_match(&self, path: &str) -> Option<usize> {
        self.patterns.iter().position(|re| re.is_match(path))
    }

    /// Returns the source text of the compiled patterns, in evaluation order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }

    /// Number of compiled patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Returns true if no pattern compiled, meaning every path is rejected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Immutable configuration of one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    name: String,
    allowed: AllowList,
    bind_mounts: Vec<String>,
    device_mappings: Vec<String>,
    gpu: bool,
}

impl ProxyPolicy {
    /// Creates a policy for the backend socket `name`.
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        patterns: &[S],
        bind_mounts: Vec<String>,
        device_mappings: Vec<String>,
        gpu: bool,
    ) -> Self {
        Self {
            name: name.into(),
            allowed: AllowList::new(patterns),
            bind_mounts,
            device_mappings,
            gpu,
        }
    }

    /// Backend socket this policy fronts.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn allowed(&self) -> &AllowList {
        &self.allowed
    }

    #[must_use]
    pub fn bind_mounts(&self) -> &[String] {
        &self.bind_mounts
    }

    #[must_use]
    pub fn device_mappings(&self) -> &[String] {
        &self.device_mappings
    }

    #[must_use]
    pub const fn gpu_enabled(&self) -> bool {
        self.gpu
    }

    /// Admits or rejects a request path.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Forbidden`] naming `path` if no pattern matches.
    pub fn check_path(&self, path: &str) -> Result<()> {
        match self.allowed.first_match(path) {
            Some(index) => {
                tracing::trace!(path, pattern = index, "path admitted");
                Ok(())
            }
            None => Err(ProxyError::Forbidden(path.to_string())),
        }
    }
}
