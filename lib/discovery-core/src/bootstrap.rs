//! Initial population of the pool from a directory snapshot

use crate::dial::Dialer;
use crate::endpoint::EndpointKey;
use crate::registry::ServicePool;
use crate::store::CoordinationStore;
use crate::{DiscoveryError, Result};
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Registrations found under the service directory, with the store index
/// the read was taken at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    /// `(key, address)` pairs in store order
    pub entries: Vec<(String, String)>,
    pub index: u64,
}

/// Read `directory` recursively and collect every
/// `<directory>/<service>/<instance>` leaf.
///
/// Leaves directly under the directory and anything nested deeper than the
/// instance level are skipped.
pub async fn read_directory<S>(store: &S, directory: &str) -> Result<DirectorySnapshot>
where
    S: CoordinationStore + ?Sized,
{
    let response = store.get_recursive(directory).await?;
    if !response.node.dir {
        return Err(DiscoveryError::NotADirectory(directory.to_string()));
    }

    let mut entries = Vec::new();
    for service in response.node.nodes.iter().filter(|n| n.dir) {
        for instance in &service.nodes {
            if instance.dir || EndpointKey::parse_under(directory, &instance.key).is_err() {
                debug!("Skipping {}: not an endpoint of {}", instance.key, directory);
                continue;
            }
            entries.push((instance.key.clone(), instance.value.clone()));
        }
    }

    Ok(DirectorySnapshot {
        entries,
        index: response.index,
    })
}

/// Connect to every service registered under `directory`.
///
/// Failures are logged and leave the pool empty; they are never fatal.
/// Returns the store index of the snapshot so watching can resume right
/// after it, or `None` if the directory could not be read.
pub async fn connect_all<S, D>(store: &S, pool: &ServicePool<D>, directory: &str) -> Option<u64>
where
    S: CoordinationStore + ?Sized,
    D: Dialer,
{
    info!("Connecting services under: {}", directory);
    let snapshot = match read_directory(store, directory).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Failed to list services under {}: {}", directory, e);
            return None;
        }
    };

    for (key, address) in &snapshot.entries {
        pool.add_service(key, address).await;
    }

    info!(
        "Services add complete: {} endpoints under {} at index {}",
        snapshot.entries.len(),
        directory,
        snapshot.index
    );
    Some(snapshot.index)
}

/// Bring the pool in line with a fresh snapshot of `directory`: register
/// every listed endpoint and drop every pooled endpoint that is no longer
/// listed.
pub async fn resync<S, D>(store: &S, pool: &ServicePool<D>, directory: &str) -> Result<u64>
where
    S: CoordinationStore + ?Sized,
    D: Dialer,
{
    let snapshot = read_directory(store, directory).await?;

    let mut listed = HashSet::with_capacity(snapshot.entries.len());
    for (key, address) in &snapshot.entries {
        pool.add_service(key, address).await;
        if let Ok(key) = EndpointKey::parse_under(directory, key) {
            listed.insert(key);
        }
    }

    let removed = pool.retain_keys(&listed).await;
    pool.metrics().resyncs_total.inc();
    info!(
        "Resynced {}: {} endpoints listed, {} stale endpoints removed, index {}",
        directory,
        snapshot.entries.len(),
        removed,
        snapshot.index
    );
    Ok(snapshot.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::names::KnownNames;
    use crate::DialError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoDialer;

    #[async_trait]
    impl Dialer for EchoDialer {
        type Conn = String;

        async fn dial(
            &self,
            address: &str,
            _timeout: Duration,
        ) -> std::result::Result<String, DialError> {
            Ok(address.to_string())
        }
    }

    fn pool() -> ServicePool<EchoDialer> {
        ServicePool::new(EchoDialer, KnownNames::disabled()).unwrap()
    }

    #[tokio::test]
    async fn test_read_directory_takes_two_levels() {
        let store = MemoryStore::new();
        store.put("/backends/names", "echo").await;
        store.put("/backends/echo/1", "10.0.0.1:1").await;
        store.put("/backends/echo/2", "10.0.0.2:1").await;
        store.put("/backends/echo/deep/x", "10.0.0.9:1").await;
        let index = store.put("/backends/chat/a", "10.0.1.1:1").await;

        let snapshot = read_directory(&store, "/backends").await.unwrap();
        assert_eq!(snapshot.index, index);
        assert_eq!(
            snapshot.entries,
            vec![
                ("/backends/chat/a".to_string(), "10.0.1.1:1".to_string()),
                ("/backends/echo/1".to_string(), "10.0.0.1:1".to_string()),
                ("/backends/echo/2".to_string(), "10.0.0.2:1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_read_directory_rejects_leaf() {
        let store = MemoryStore::new();
        store.put("/backends", "oops").await;
        let err = read_directory(&store, "/backends").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_connect_all_survives_missing_directory() {
        let store = MemoryStore::new();
        let pool = pool();
        assert_eq!(connect_all(&store, &pool, "/backends").await, None);
        assert_eq!(pool.service_count().await, 0);
    }

    #[tokio::test]
    async fn test_resync_prunes_stale_endpoints() {
        let store = MemoryStore::new();
        store.put("/backends/echo/1", "10.0.0.1:1").await;
        store.put("/backends/echo/2", "10.0.0.2:1").await;
        let pool = pool();
        assert!(connect_all(&store, &pool, "/backends").await.is_some());
        assert_eq!(pool.endpoint_count("/backends/echo").await, 2);

        store.delete("/backends/echo/1").await;
        store.put("/backends/echo/3", "10.0.0.3:1").await;
        let index = resync(&store, &pool, "/backends").await.unwrap();

        assert_eq!(index, store.index().await);
        assert_eq!(pool.get_service_with_id("/backends/echo", "1").await, None);
        assert_eq!(
            pool.get_service_with_id("/backends/echo", "3").await,
            Some("10.0.0.3:1".to_string())
        );
        assert_eq!(pool.endpoint_count("/backends/echo").await, 2);
        assert!(pool.metrics().gather().unwrap().contains("discovery_resyncs_total 1"));
    }
}
