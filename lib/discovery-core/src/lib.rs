//! Client-side service discovery and connection pooling
//!
//! This library provides:
//! - A connection pool of endpoints discovered under `<root>/<service>/<instance>` keys
//! - Bootstrap from a directory snapshot and reconciliation from the store's change feed
//! - Round-robin and exact-instance lookup over the pool
//! - An allow-list of service names, failing open when it cannot be read

pub mod bootstrap;
pub mod config;
pub mod dial;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod names;
pub mod reconciler;
pub mod registry;
pub mod store;

pub use config::{DiscoveryConfig, ResyncPolicy, WatchBackoff, DEFAULT_DIAL_TIMEOUT};
pub use dial::{Dialer, GrpcDialer};
pub use discovery::ServiceDiscovery;
pub use endpoint::{EndpointKey, ServicePath};
pub use error::{DialError, DiscoveryError, Result, StoreError};
pub use memory::MemoryStore;
pub use metrics::PoolMetrics;
pub use names::KnownNames;
pub use reconciler::{Reconciler, WatchStart};
pub use registry::{AddOutcome, EndpointSnapshot, ServicePool, ServiceSnapshot};
pub use store::{CoordinationStore, Node, StoreResponse, WatchEvent, Watcher};
