//! etcd v2 coordination store for service discovery
pub mod client;
pub mod error;
pub mod wire;

pub use client::{EtcdClient, DEFAULT_WATCH_POLL_TIMEOUT, TCP_KEEPALIVE};
pub use error::{EtcdError, Result};
