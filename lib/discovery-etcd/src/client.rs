//! HTTP client for the etcd v2 keys API

use crate::error::{EtcdError, Result};
use crate::wire;
use async_trait::async_trait;
use discovery_core::store::StoreResult;
use discovery_core::{
    CoordinationStore, DiscoveryConfig, StoreError, StoreResponse, WatchEvent, Watcher,
};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the store-wide index at the time of a read
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Keepalive probe interval, so a peer that vanished without a reset is
/// eventually noticed
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Upper bound on one long poll; an idle watch is re-issued after this
pub const DEFAULT_WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(300);

struct Inner {
    http: Client,
    endpoints: Vec<Url>,
    // Index into `endpoints` of the last endpoint that answered
    preferred: AtomicUsize,
    request_timeout: Duration,
}

/// EtcdClient reads and watches keys on an etcd cluster.
///
/// Requests go to the last endpoint that answered and fail over to the
/// others in order when it cannot be reached.
#[derive(Clone)]
pub struct EtcdClient {
    inner: Arc<Inner>,
    watch_poll_timeout: Duration,
}

impl EtcdClient {
    /// Create a client for the given endpoint URLs
    pub fn new(endpoints: &[String], request_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(EtcdError::NoEndpoints);
        }

        let endpoints = endpoints
            .iter()
            .map(|endpoint| {
                Url::parse(endpoint.trim_end_matches('/')).map_err(|e| EtcdError::InvalidEndpoint {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // No overall timeout: watches are long polls bounded separately
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                endpoints,
                preferred: AtomicUsize::new(0),
                request_timeout,
            }),
            watch_poll_timeout: DEFAULT_WATCH_POLL_TIMEOUT,
        })
    }

    /// Bound each watch long poll to `timeout`
    pub fn with_watch_poll_timeout(mut self, timeout: Duration) -> Self {
        self.watch_poll_timeout = timeout;
        self
    }

    /// Create a client from the endpoints and timeout in a discovery config
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        Self::new(&config.etcd_endpoints, config.request_timeout)
    }

    /// Configured endpoints, in failover order
    pub fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints.iter().map(|u| u.to_string()).collect()
    }

    fn keys_url(base: &Url, key: &str) -> StoreResult<Url> {
        let key = if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{}", key)
        };
        let base = base.as_str().trim_end_matches('/');
        Url::parse(&format!("{}/v2/keys{}", base, key))
            .map_err(|e| StoreError::InvalidResponse(format!("invalid key {}: {}", key, e)))
    }

    /// Send a GET for `key`, failing over across endpoints on transport errors.
    /// Returns status, `X-Etcd-Index` and body.
    async fn get_raw(
        &self,
        key: &str,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> StoreResult<(u16, Option<u64>, Vec<u8>)> {
        let count = self.inner.endpoints.len();
        let start = self.inner.preferred.load(Ordering::Relaxed) % count;
        let mut last_error = String::new();

        for offset in 0..count {
            let idx = (start + offset) % count;
            let url = Self::keys_url(&self.inner.endpoints[idx], key)?;

            let mut request = self.inner.http.get(url.clone()).query(query);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("etcd request to {} failed: {}", url, e);
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            let etcd_index = response
                .headers()
                .get(ETCD_INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Reading etcd response from {} failed: {}", url, e);
                    last_error = e.to_string();
                    continue;
                }
            };

            self.inner.preferred.store(idx, Ordering::Relaxed);
            debug!("etcd GET {} -> {}", url, status);
            return Ok((status, etcd_index, body.to_vec()));
        }

        Err(StoreError::Unavailable(last_error))
    }

    async fn read(&self, key: &str, recursive: bool) -> StoreResult<StoreResponse> {
        let mut query = Vec::new();
        if recursive {
            query.push(("recursive", "true".to_string()));
        }
        let (status, etcd_index, body) = self
            .get_raw(key, &query, Some(self.inner.request_timeout))
            .await?;
        wire::decode_read(status, etcd_index, &body)
    }

    /// Block until the next change at or after `wait_index` below `key`.
    async fn wait(&self, key: &str, wait_index: Option<u64>) -> StoreResult<WatchEvent> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
        ];
        if let Some(index) = wait_index {
            query.push(("waitIndex", index.to_string()));
        }
        let (status, _, body) = self.get_raw(key, &query, None).await?;
        wire::decode_watch(status, wait_index, &body)
    }
}

#[async_trait]
impl CoordinationStore for EtcdClient {
    async fn get(&self, key: &str) -> StoreResult<StoreResponse> {
        self.read(key, false).await
    }

    async fn get_recursive(&self, key: &str) -> StoreResult<StoreResponse> {
        self.read(key, true).await
    }

    async fn watcher(&self, key: &str, after_index: Option<u64>) -> StoreResult<Box<dyn Watcher>> {
        Ok(Box::new(EtcdWatcher {
            client: self.clone(),
            key: key.to_string(),
            wait_index: after_index.map(|i| i + 1),
        }))
    }
}

/// Recursive watch issuing one long poll per event
struct EtcdWatcher {
    client: EtcdClient,
    key: String,
    wait_index: Option<u64>,
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> StoreResult<WatchEvent> {
        let poll_timeout = self.client.watch_poll_timeout;
        loop {
            let wait = self.client.wait(&self.key, self.wait_index);
            match tokio::time::timeout(poll_timeout, wait).await {
                Ok(event) => {
                    let event = event?;
                    self.wait_index = Some(event.index + 1);
                    return Ok(event);
                }
                // Nothing changed, or the connection went quiet: poll again
                // from the same index
                Err(_) => debug!(
                    "Watch on {} idle for {:?}, re-issuing",
                    self.key, poll_timeout
                ),
            }
        }
    }
}
