//! Container-creation payload types.
//!
//! Only the fields the proxy rewrites are modelled strongly. Everything else
//! the Docker Engine API defines is kept in a side map per object so that a
//! decode/encode cycle never drops caller-supplied data.
//! See: <https://docs.docker.com/engine/api/v1.43/#tag/Container/operation/ContainerCreate>

use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Decoded body of a `POST /containers/create` request.
///
/// On the wire the process-level `Config` fields sit at the top level of the
/// JSON object next to the `HostConfig` and `NetworkingConfig` objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Process and image level settings.
    #[serde(flatten)]
    pub config: Config,
    /// Host resource bindings.
    #[serde(rename = "HostConfig", default, skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
    /// Network attachment settings.
    #[serde(
        rename = "NetworkingConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub networking_config: Option<NetworkingConfig>,
    /// Set once host-specific mappings have been injected.
    #[serde(skip)]
    pub(crate) enriched: bool,
}

impl ContainerConfig {
    /// Returns the host config, creating an empty one if the caller sent none.
    pub fn host_config_mut(&mut self) -> &mut HostConfig {
        self.host_config.get_or_insert_with(HostConfig::default)
    }

    /// Returns true once [`crate::rewrite::enrich`] has run on this value.
    #[must_use]
    pub const fn is_enriched(&self) -> bool {
        self.enriched
    }
}

/// Process and image level settings (`Image`, `Cmd`, `Env`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Environment variables in `KEY=value` form.
    #[serde(rename = "Env", default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Fields the proxy passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Config {
    /// Returns the image reference, if the caller set one.
    #[must_use]
    pub fn image(&self) -> Option<&str> {
        self.extra.get("Image").and_then(Value::as_str)
    }
}

/// Host configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Binds (`host:container[:mode]` volume mounts).
    #[serde(rename = "Binds", default, skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    /// Device nodes exposed to the container.
    #[serde(rename = "Devices", default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceMapping>>,
    /// Fields the proxy passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Networking configuration, passed through as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkingConfig {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Rewrites keys the engine would match case-insensitively onto their
/// canonical spelling, so `hostConfig` and `HostConfig` land in one place.
///
/// When several spellings are present their values are merged in map key
/// order: lists are concatenated, objects are merged key by key, and for
/// scalars the later value wins.
pub fn canonicalize_keys(body: &mut Value) {
    let Some(top) = body.as_object_mut() else {
        return;
    };
    fold_keys(top, &["HostConfig", "NetworkingConfig", "Env"]);

    let Some(host) = top.get_mut("HostConfig").and_then(Value::as_object_mut) else {
        return;
    };
    fold_keys(host, &["Binds", "Devices"]);
    if let Some(devices) = host.get_mut("Devices").and_then(Value::as_array_mut) {
        for device in devices.iter_mut().filter_map(Value::as_object_mut) {
            fold_keys(device, &["PathOnHost", "PathInContainer", "CgroupPermissions"]);
        }
    }
}

fn fold_keys(map: &mut Map<String, Value>, canonical: &[&str]) {
    for name in canonical {
        let keys: Vec<String> = map
            .keys()
            .filter(|k| k.eq_ignore_ascii_case(name))
            .cloned()
            .collect();
        if keys.iter().all(|k| k == name) {
            continue;
        }

        let mut merged: Option<Value> = None;
        for key in &keys {
            if let Some(value) = map.remove(key) {
                match merged.as_mut() {
                    Some(into) => merge_value(into, value),
                    None => merged = Some(value),
                }
            }
        }
        if let Some(value) = merged {
            tracing::debug!(key = *name, variants = ?keys, "folded case-variant keys");
            map.insert((*name).to_string(), value);
        }
    }
}

fn merge_value(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Array(items), Value::Array(more)) => items.extend(more),
        (Value::Object(fields), Value::Object(more)) => {
            for (key, value) in more {
                match fields.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        fields.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

/// Device mapping between host and container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMapping {
    /// Device path on the host.
    #[serde(default)]
    pub path_on_host: String,
    /// Device path inside the container.
    #[serde(default)]
    pub path_in_container: String,
    /// Cgroup permissions (`r`, `w`, `m` combinations).
    #[serde(default)]
    pub cgroup_permissions: String,
    /// Fields the proxy passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FromStr for DeviceMapping {
    type Err = ProxyError;

    /// Parses a `host:container:perm` spec.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [host, container, perm]
                if !host.is_empty() && !container.is_empty() && !perm.is_empty() =>
            {
                Ok(Self {
                    path_on_host: (*host).to_string(),
                    path_in_container: (*container).to_string(),
                    cgroup_permissions: (*perm).to_string(),
                    extra: Map::new(),
                })
            }
            _ => Err(ProxyError::InvalidDevice(spec.to_string())),
        }
    }
}

impl fmt::Display for DeviceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.path_on_host, self.path_in_container, self.cgroup_permissions
        )
    }
}
