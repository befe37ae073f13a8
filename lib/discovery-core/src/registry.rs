//! Connection pool of discovered service endpoints
//!
//! The pool maps each canonical service path to an ordered list of live
//! clients plus a round-robin cursor. All mutations take the write lock and
//! all lookups take the read lock. Dialing happens before the write lock is
//! taken, so a slow endpoint never stalls lookups.

use crate::dial::Dialer;
use crate::endpoint::{EndpointKey, ServicePath};
use crate::metrics::PoolMetrics;
use crate::names::KnownNames;
use crate::{DialError, Result, DEFAULT_DIAL_TIMEOUT};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// A single connection to one registered endpoint
#[derive(Debug)]
struct Client<C> {
    key: EndpointKey,
    address: String,
    conn: C,
}

/// All connections for one kind of service
#[derive(Debug)]
struct Service<C> {
    clients: Vec<Client<C>>,
    cursor: AtomicUsize,
}

impl<C: Clone> Service<C> {
    fn new() -> Self {
        Self {
            clients: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn position(&self, key: &EndpointKey) -> Option<usize> {
        self.clients.iter().position(|c| &c.key == key)
    }

    /// Advance the cursor and pick the client it lands on.
    fn next_round_robin(&self) -> Option<C> {
        if self.clients.is_empty() {
            return None;
        }

        let current = self.cursor.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        self.clients
            .get(current % self.clients.len())
            .map(|c| c.conn.clone())
    }
}

/// What [`ServicePool::add_service`] did with a registration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new client was appended
    Added,
    /// The key was present with another address; its connection was replaced in place
    Updated,
    /// The key was already present with the same address
    Unchanged,
    /// Name checking is enabled and the service is not in the allow-list
    Rejected,
    /// The key could not be parsed
    InvalidKey,
    /// The address could not be dialed
    DialFailed,
}

/// Point-in-time view of one service, for logs and status endpoints
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub name: ServicePath,
    pub endpoints: Vec<EndpointSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndpointSnapshot {
    pub key: String,
    pub address: String,
}

/// ServicePool maintains live connections to every discovered endpoint
pub struct ServicePool<D: Dialer> {
    services: RwLock<HashMap<ServicePath, Service<D::Conn>>>,
    known_names: KnownNames,
    dialer: D,
    dial_timeout: Duration,
    metrics: PoolMetrics,
}

impl<D: Dialer> ServicePool<D> {
    pub fn new(dialer: D, known_names: KnownNames) -> Result<Self> {
        Ok(Self {
            services: RwLock::new(HashMap::new()),
            known_names,
            dialer,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            metrics: PoolMetrics::new()?,
        })
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: PoolMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn known_names(&self) -> &KnownNames {
        &self.known_names
    }

    /// Register the endpoint `key` reachable at `address`.
    ///
    /// The service is created on first sight if its name is allowed. The
    /// dial runs without holding the pool lock; only the splice of the new
    /// client is done under the write lock. Failed dials are logged and not
    /// retried.
    pub async fn add_service(&self, key: &str, address: &str) -> AddOutcome {
        let key = match EndpointKey::parse(key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Ignoring registration: {}", e);
                return AddOutcome::InvalidKey;
            }
        };
        let service_name = key.service().clone();

        if !self.known_names.allows(&service_name) {
            warn!("Service not in names: {}, ignored", service_name);
            return AddOutcome::Rejected;
        }

        {
            let services = self.services.read().await;
            let unchanged = services
                .get(&service_name)
                .and_then(|s| s.position(&key).map(|idx| s.clients[idx].address == address))
                .unwrap_or(false);
            if unchanged {
                debug!("Service already registered: {} -- {}", key, address);
                return AddOutcome::Unchanged;
            }
        }

        let dialed = match tokio::time::timeout(
            self.dial_timeout,
            self.dialer.dial(address, self.dial_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(address.to_string())),
        };

        let mut services = self.services.write().await;
        let service = services.entry(service_name.clone()).or_insert_with(|| {
            debug!("New service type: {}", service_name);
            Service::new()
        });

        let conn = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                error!("Did not connect: {} -- {} err: {}", key, address, e);
                self.metrics
                    .dial_failures_total
                    .with_label_values(&[service_name.as_str()])
                    .inc();
                self.metrics
                    .set_endpoints(service_name.as_str(), service.clients.len());
                return AddOutcome::DialFailed;
            }
        };

        let client = Client {
            key,
            address: address.to_string(),
            conn,
        };
        let outcome = match service.position(&client.key) {
            Some(idx) => {
                debug!("Service updated: {} -- {}", client.key, address);
                service.clients[idx] = client;
                AddOutcome::Updated
            }
            None => {
                debug!("Service added: {} -- {}", client.key, address);
                service.clients.push(client);
                AddOutcome::Added
            }
        };
        self.metrics
            .set_endpoints(service_name.as_str(), service.clients.len());
        outcome
    }

    /// Drop the client registered under `key`, keeping the order of the rest.
    ///
    /// Returns whether a client was removed.
    pub async fn remove_service(&self, key: &str) -> bool {
        let key = match EndpointKey::parse(key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Ignoring removal: {}", e);
                return false;
            }
        };

        let mut services = self.services.write().await;
        let Some(service) = services.get_mut(key.service()) else {
            debug!("No such service {}", key.service());
            return false;
        };

        match service.position(&key) {
            Some(idx) => {
                service.clients.remove(idx);
                self.metrics
                    .set_endpoints(key.service().as_str(), service.clients.len());
                debug!("Service removed {}", key);
                true
            }
            None => {
                debug!("No such endpoint {}", key);
                false
            }
        }
    }

    /// Drop every client of `path`. The service record itself stays, empty.
    /// Returns how many clients went.
    pub async fn clear_service(&self, path: &str) -> usize {
        let mut services = self.services.write().await;
        let Some(service) = services.get_mut(path) else {
            debug!("No such service {}", path);
            return 0;
        };
        let removed = service.clients.len();
        service.clients.clear();
        self.metrics.set_endpoints(path, 0);
        debug!("Service cleared {}: {} endpoints removed", path, removed);
        removed
    }

    /// Remove every client whose key is not in `keep`. Returns how many went.
    pub async fn retain_keys(&self, keep: &HashSet<EndpointKey>) -> usize {
        let mut services = self.services.write().await;
        let mut removed = 0;
        for (name, service) in services.iter_mut() {
            let before = service.clients.len();
            service.clients.retain(|c| {
                let retained = keep.contains(&c.key);
                if !retained {
                    debug!("Service removed {}", c.key);
                }
                retained
            });
            if service.clients.len() != before {
                removed += before - service.clients.len();
                self.metrics.set_endpoints(name.as_str(), service.clients.len());
            }
        }
        removed
    }

    /// Get a connection for `path` in round-robin order.
    ///
    /// `None` when the service is unknown or has no live endpoints.
    pub async fn get_service(&self, path: &str) -> Option<D::Conn> {
        let services = self.services.read().await;
        services.get(path)?.next_round_robin()
    }

    /// Get the connection of one specific instance, e.g. path
    /// `/backends/snowflake` and id `s1` for key `/backends/snowflake/s1`.
    ///
    /// No fallback to round robin when the instance is missing.
    pub async fn get_service_with_id(&self, path: &str, id: &str) -> Option<D::Conn> {
        let key = EndpointKey::from_parts(path, id).ok()?;
        let services = self.services.read().await;
        let service = services.get(path)?;
        service
            .position(&key)
            .map(|idx| service.clients[idx].conn.clone())
    }

    /// Number of services known to the pool, including empty ones
    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }

    /// Number of live endpoints for `path`
    pub async fn endpoint_count(&self, path: &str) -> usize {
        let services = self.services.read().await;
        services.get(path).map_or(0, |s| s.clients.len())
    }

    /// Whether a service record exists for `path`, even if empty
    pub async fn contains_service(&self, path: &str) -> bool {
        self.services.read().await.contains_key(path)
    }

    /// All services and their endpoints, sorted by service name
    pub async fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let services = self.services.read().await;
        let mut snapshot: Vec<ServiceSnapshot> = services
            .iter()
            .map(|(name, service)| ServiceSnapshot {
                name: name.clone(),
                endpoints: service
                    .clients
                    .iter()
                    .map(|c| EndpointSnapshot {
                        key: c.key.full_key(),
                        address: c.address.clone(),
                    })
                    .collect(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}
