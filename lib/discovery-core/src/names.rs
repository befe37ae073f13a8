//! Allow-list of canonical service names
//!
//! Loaded once from a single store key holding bare service names, one per
//! line. If the key cannot be read the check is disabled and every
//! discovered service is accepted.

use crate::endpoint::ServicePath;
use crate::store::CoordinationStore;
use std::collections::HashSet;
use tracing::{error, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KnownNames {
    // None means name checking is disabled
    names: Option<HashSet<ServicePath>>,
}

impl KnownNames {
    /// Accept every service.
    pub fn disabled() -> Self {
        Self { names: None }
    }

    /// Accept only the given canonical paths.
    pub fn from_paths(paths: impl IntoIterator<Item = ServicePath>) -> Self {
        Self {
            names: Some(paths.into_iter().collect()),
        }
    }

    /// Canonicalize newline-separated bare names under `root`.
    pub fn parse(root: &str, value: &str) -> Self {
        let mut names = HashSet::new();
        for line in value.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match ServicePath::new(root, line) {
                Ok(path) => {
                    names.insert(path);
                }
                Err(e) => warn!("Skipping invalid service name {:?}: {}", line, e),
            }
        }
        Self { names: Some(names) }
    }

    /// Read the allow-list from `key`, failing open on any error.
    pub async fn load<S>(store: &S, key: &str, root: &str) -> Self
    where
        S: CoordinationStore + ?Sized,
    {
        info!("Reading service names from {}", key);
        let response = match store.get(key).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to read service names from {}: {}; name check disabled", key, e);
                return Self::disabled();
            }
        };

        if response.node.dir {
            error!("Service names key {} is a directory; name check disabled", key);
            return Self::disabled();
        }

        let names = Self::parse(root, &response.node.value);
        info!("Loaded {} service names", names.len());
        names
    }

    pub fn is_enabled(&self) -> bool {
        self.names.is_some()
    }

    /// Whether a service may be added to the pool.
    pub fn allows(&self, service: &ServicePath) -> bool {
        match &self.names {
            Some(names) => names.contains(service),
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.names.as_ref().map_or(0, HashSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ServicePath {
        ServicePath::parse(p).unwrap()
    }

    #[test]
    fn test_parse_names() {
        let names = KnownNames::parse("/backends", "snowflake\n geoip \n\nchat\n");
        assert!(names.is_enabled());
        assert_eq!(names.len(), 3);
        assert!(names.allows(&path("/backends/snowflake")));
        assert!(names.allows(&path("/backends/geoip")));
        assert!(names.allows(&path("/backends/chat")));
        assert!(!names.allows(&path("/backends/bar")));
        assert!(!names.allows(&path("/backends")));
    }

    #[test]
    fn test_disabled_allows_everything() {
        let names = KnownNames::disabled();
        assert!(!names.is_enabled());
        assert!(names.allows(&path("/backends/anything")));
        assert!(names.is_empty());
    }

    #[test]
    fn test_empty_value_enables_check() {
        let names = KnownNames::parse("/backends", "");
        assert!(names.is_enabled());
        assert!(!names.allows(&path("/backends/foo")));
    }
}
