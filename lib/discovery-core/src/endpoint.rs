//! Typed service paths and endpoint keys
//!
//! Endpoints are registered in the store as `<root>/<service-name>/<instance-id>`.
//! Keys are parsed once into an [`EndpointKey`] so the rest of the crate never
//! splits strings.

use crate::{DiscoveryError, Result};
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;

/// Canonical path of a service kind, e.g. `/backends/snowflake`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServicePath(String);

impl ServicePath {
    /// Build `<root>/<name>` from a root directory and a bare service name.
    pub fn new(root: &str, name: &str) -> Result<Self> {
        let root = root.trim_end_matches('/');
        let name = name.trim_matches('/');
        if name.is_empty() {
            return Err(DiscoveryError::InvalidKey(format!("{}/", root)));
        }
        Self::parse(&format!("{}/{}", root, name))
    }

    /// Parse an absolute path without a trailing slash.
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
            return Err(DiscoveryError::InvalidKey(path.to_string()));
        }
        Ok(Self(path.to_string()))
    }

    /// Parse `path` as a service directly below `root`, i.e. `<root>/<name>`.
    pub fn parse_under(root: &str, path: &str) -> Result<Self> {
        match relative_to(root, path) {
            Some(name) if !name.contains('/') => Self::parse(path),
            _ => Err(DiscoveryError::InvalidKey(path.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment (the bare service name).
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for ServicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServicePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets maps keyed by ServicePath be queried with a plain &str.
impl Borrow<str> for ServicePath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The part of `path` strictly below `root`, without the separating `/`.
fn relative_to<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    path.strip_prefix(root.trim_end_matches('/'))?
        .strip_prefix('/')
        .filter(|rest| !rest.is_empty())
}

/// One registration: the service it belongs to plus its instance id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    service: ServicePath,
    instance: String,
}

impl EndpointKey {
    /// Split a full key at its last `/` into service path and instance id.
    pub fn parse(key: &str) -> Result<Self> {
        let (parent, instance) = key
            .rsplit_once('/')
            .ok_or_else(|| DiscoveryError::InvalidKey(key.to_string()))?;
        if instance.is_empty() {
            return Err(DiscoveryError::InvalidKey(key.to_string()));
        }
        let service = ServicePath::parse(parent)
            .map_err(|_| DiscoveryError::InvalidKey(key.to_string()))?;
        Ok(Self {
            service,
            instance: instance.to_string(),
        })
    }

    /// Parse `key` as `<root>/<service-name>/<instance-id>`: exactly two
    /// segments below `root`.
    pub fn parse_under(root: &str, key: &str) -> Result<Self> {
        let two_levels = relative_to(root, key)
            .and_then(|rest| rest.split_once('/'))
            .is_some_and(|(service, instance)| {
                !service.is_empty() && !instance.is_empty() && !instance.contains('/')
            });
        if !two_levels {
            return Err(DiscoveryError::InvalidKey(key.to_string()));
        }
        Self::parse(key)
    }

    /// Build the key of instance `id` under `path`. Used for exact lookups.
    pub fn from_parts(path: &str, id: &str) -> Result<Self> {
        Self::parse(&format!("{}/{}", path, id))
    }

    pub fn service(&self) -> &ServicePath {
        &self.service
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn full_key(&self) -> String {
        format!("{}/{}", self.service, self.instance)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.instance)
    }
}
