//! Discovery configuration

use std::time::Duration;

/// Store endpoint used when `ETCD_HOST` is not set.
pub const DEFAULT_ETCD: &str = "http://172.17.42.1:2379";
/// Directory holding one subdirectory per service.
pub const DEFAULT_SERVICE_ROOT: &str = "/backends";
/// Key holding the newline-separated allow-list of service names.
pub const DEFAULT_NAMES_KEY: &str = "/backends/names";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment variable overriding the store endpoints (`;`-separated).
pub const ETCD_HOST_ENV: &str = "ETCD_HOST";

/// Backoff applied between change-feed re-subscriptions
#[derive(Clone, Debug, PartialEq)]
pub struct WatchBackoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound on the delay
    pub max: Duration,
}

impl Default for WatchBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl WatchBackoff {
    /// Delay before re-subscribing after `attempt` consecutive failures (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as u64;
        let exponential = 2u64.saturating_pow(attempt);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }
}

/// What the reconciler does after it loses the change feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResyncPolicy {
    /// Re-read the whole service directory and reconcile the pool against it
    /// before watching again. Changes made while the feed was down are not lost.
    #[default]
    Full,
    /// Only re-subscribe. Changes missed while the feed was down (for example
    /// because the store compacted its history) are never applied.
    Never,
}

/// Settings for a [`crate::ServiceDiscovery`] instance
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub etcd_endpoints: Vec<String>,
    pub service_root: String,
    pub names_key: String,
    pub dial_timeout: Duration,
    /// Timeout for non-watch store requests
    pub request_timeout: Duration,
    pub watch_backoff: WatchBackoff,
    pub resync: ResyncPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec![DEFAULT_ETCD.to_string()],
            service_root: DEFAULT_SERVICE_ROOT.to_string(),
            names_key: DEFAULT_NAMES_KEY.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: Duration::from_secs(5),
            watch_backoff: WatchBackoff::default(),
            resync: ResyncPolicy::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Defaults, with store endpoints taken from `ETCD_HOST` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(hosts) = std::env::var(ETCD_HOST_ENV) {
            if let Some(endpoints) = parse_endpoints(&hosts) {
                config.etcd_endpoints = endpoints;
            }
        }
        config
    }

    pub fn with_etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = endpoints;
        self
    }

    pub fn with_service_root(mut self, root: impl Into<String>) -> Self {
        self.service_root = root.into();
        self
    }

    pub fn with_names_key(mut self, key: impl Into<String>) -> Self {
        self.names_key = key.into();
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_watch_backoff(mut self, backoff: WatchBackoff) -> Self {
        self.watch_backoff = backoff;
        self
    }

    pub fn with_resync(mut self, resync: ResyncPolicy) -> Self {
        self.resync = resync;
        self
    }
}

/// Split a `;`-separated endpoint list, ignoring blanks. `None` if nothing is left.
pub fn parse_endpoints(hosts: &str) -> Option<Vec<String>> {
    let endpoints: Vec<String> = hosts
        .split(';')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();
    if endpoints.is_empty() {
        None
    } else {
        Some(endpoints)
    }
}
