//! Container-creation body rewriting.
//!
//! The engine decodes a create payload into [`ContainerConfig`], appends the
//! host-specific bind mounts and device mappings from the [`ProxyPolicy`],
//! and re-encodes it. Caller-supplied entries are never removed.

use crate::error::{ProxyError, Result};
use crate::policy::{GPU_DEVICES, GPU_DRIVER_BIND, GPU_PATH_ENV, ProxyPolicy};
use crate::types::{ContainerConfig, DeviceMapping, canonicalize_keys};
use axum::http::{HeaderValue, Method};
use bytes::Bytes;
use regex::Regex;
use std::sync::LazyLock;

static CONTAINER_CREATE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(/v[0-9]+\.[0-9]+)?/containers/create/?$").expect("static pattern is valid")
});

/// Returns true if the request creates a container and must be rewritten.
#[must_use]
pub fn is_container_create(method: &Method, path: &str) -> bool {
    method == Method::POST && CONTAINER_CREATE_PATH.is_match(path)
}

/// Re-encoded request body.
///
/// The outgoing `Content-Length` is always taken from here so it cannot drift
/// from the bytes actually sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenBody {
    bytes: Bytes,
}

impl RewrittenBody {
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `Content-Length` header value for this body.
    #[must_use]
    pub fn content_length(&self) -> HeaderValue {
        HeaderValue::from(self.bytes.len())
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

/// Decodes a container-creation body.
///
/// Keys are matched case-insensitively, as the engine does, so a caller's
/// `hostConfig` is rewritten in place rather than shadowed by an injected
/// `HostConfig`.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidBody`] if the body is not a JSON object of
/// the expected shape.
pub fn decode(body: &[u8]) -> Result<ContainerConfig> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ProxyError::InvalidBody(e.to_string()))?;
    canonicalize_keys(&mut value);
    serde_json::from_value(value).map_err(|e| ProxyError::InvalidBody(e.to_string()))
}

/// Encodes a container config back to its JSON wire form.
///
/// # Errors
///
/// Returns [`ProxyError::Encode`] if serialisation fails.
pub fn encode(config: &ContainerConfig) -> Result<RewrittenBody> {
    let bytes = serde_json::to_vec(config).map_err(|e| ProxyError::Encode(e.to_string()))?;
    Ok(RewrittenBody {
        bytes: Bytes::from(bytes),
    })
}

/// Injects the policy's bind mounts and device mappings into `config`.
///
/// Runs at most once per value: later calls on an already enriched config
/// are no-ops. Device specs that do not parse are skipped individually.
pub fn enrich(config: &mut ContainerConfig, policy: &ProxyPolicy) {
    if config.enriched {
        tracing::debug!("container config already enriched, skipping");
        return;
    }
    config.enriched = true;

    let mut device_specs: Vec<&str> = policy.device_mappings().iter().map(String::as_str).collect();
    let mut binds: Vec<&str> = Vec::new();

    if policy.gpu_enabled() {
        tracing::debug!("adding GPU driver mount and devices");
        binds.push(GPU_DRIVER_BIND);
        device_specs.extend(GPU_DEVICES);
        config
            .config
            .env
            .get_or_insert_with(Vec::new)
            .push(GPU_PATH_ENV.to_string());
    }

    binds.extend(
        policy
            .bind_mounts()
            .iter()
            .map(String::as_str)
            .filter(|b| !b.is_empty()),
    );

    let devices: Vec<DeviceMapping> = device_specs
        .into_iter()
        .filter(|d| !d.is_empty())
        .filter_map(|spec| match spec.parse::<DeviceMapping>() {
            Ok(dm) => Some(dm),
            Err(e) => {
                tracing::warn!(spec, "skipping device mapping: {}", e);
                None
            }
        })
        .collect();

    if binds.is_empty() && devices.is_empty() {
        return;
    }

    let host = config.host_config_mut();
    if !binds.is_empty() {
        let target = host.binds.get_or_insert_with(Vec::new);
        for bind in binds {
            tracing::debug!(bind, "adding bind mount");
            target.push(bind.to_string());
        }
    }
    if !devices.is_empty() {
        let target = host.devices.get_or_insert_with(Vec::new);
        for device in devices {
            tracing::debug!(device = %device, "adding device");
            target.push(device);
        }
    }
}

/// Decodes, enriches and re-encodes a container-creation body.
///
/// Returns `None` when the body carries no content, in which case the
/// original body is forwarded unchanged.
///
/// # Errors
///
/// Returns an error if the body cannot be decoded or re-encoded.
pub fn rewrite_body(body: &[u8], policy: &ProxyPolicy) -> Result<Option<RewrittenBody>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let mut config = decode(body)?;
    enrich(&mut config, policy);
    let rewritten = encode(&config)?;

    tracing::debug!(
        image = config.config.image().unwrap_or_default(),
        original_len = body.len(),
        rewritten_len = rewritten.len(),
        "rewrote container create body"
    );
    Ok(Some(rewritten))
}
