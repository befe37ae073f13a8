//! Entry point tying the name registry, bootstrap and reconciler together

use crate::bootstrap;
use crate::config::{DiscoveryConfig, ResyncPolicy};
use crate::dial::Dialer;
use crate::endpoint::ServicePath;
use crate::names::KnownNames;
use crate::reconciler::{Reconciler, WatchStart};
use crate::registry::ServicePool;
use crate::store::CoordinationStore;
use crate::{DiscoveryError, Result};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::info;

/// Handle to a discovered set of services.
///
/// Construct one per process and share it (e.g. in an `Arc`). Nothing
/// happens until [`initialize`](Self::initialize) is awaited; lookups made
/// before that simply find nothing. Dropping the handle stops the
/// background reconciler.
pub struct ServiceDiscovery<S: CoordinationStore + ?Sized, D: Dialer> {
    config: DiscoveryConfig,
    store: Arc<S>,
    dialer: D,
    pool: OnceCell<Arc<ServicePool<D>>>,
    reconciler: OnceLock<JoinHandle<()>>,
}

impl<S, D> ServiceDiscovery<S, D>
where
    S: CoordinationStore + ?Sized + 'static,
    D: Dialer + Clone,
{
    pub fn new(config: DiscoveryConfig, store: Arc<S>, dialer: D) -> Self {
        Self {
            config,
            store,
            dialer,
            pool: OnceCell::new(),
            reconciler: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Load the name allow-list, connect to every registered endpoint and
    /// start following changes.
    ///
    /// Runs once; later and concurrent calls wait for the first to finish
    /// and return the same pool. Only an invalid configuration is an error:
    /// store and dial failures are logged and leave the pool partially
    /// populated.
    pub async fn initialize(&self) -> Result<Arc<ServicePool<D>>> {
        let pool = self
            .pool
            .get_or_try_init(|| async {
                let root = ServicePath::parse(&self.config.service_root).map_err(|_| {
                    DiscoveryError::InvalidConfiguration(format!(
                        "service root {:?} is not an absolute path",
                        self.config.service_root
                    ))
                })?;
                info!("Initializing service discovery under {}", root);

                let names =
                    KnownNames::load(self.store.as_ref(), &self.config.names_key, root.as_str())
                        .await;
                let pool = Arc::new(
                    ServicePool::new(self.dialer.clone(), names)?
                        .with_dial_timeout(self.config.dial_timeout),
                );

                let start =
                    match bootstrap::connect_all(self.store.as_ref(), &pool, root.as_str()).await {
                        Some(index) => WatchStart::After(index),
                        None => match self.config.resync {
                            ResyncPolicy::Full => WatchStart::Resync,
                            ResyncPolicy::Never => WatchStart::Now,
                        },
                    };

                let handle = Reconciler::new(self.store.clone(), pool.clone(), root.as_str())
                    .with_backoff(self.config.watch_backoff.clone())
                    .with_resync(self.config.resync)
                    .spawn(start);
                let _ = self.reconciler.set(handle);

                info!("Service discovery initialized");
                Ok::<_, DiscoveryError>(pool)
            })
            .await?;
        Ok(pool.clone())
    }

    /// The pool, once [`initialize`](Self::initialize) has completed
    pub fn pool(&self) -> Option<&Arc<ServicePool<D>>> {
        self.pool.get()
    }

    /// Round-robin connection to `path`, e.g. `/backends/snowflake`
    pub async fn get_service(&self, path: &str) -> Option<D::Conn> {
        self.pool.get()?.get_service(path).await
    }

    /// Connection to instance `id` of `path`
    pub async fn get_service_with_id(&self, path: &str, id: &str) -> Option<D::Conn> {
        self.pool.get()?.get_service_with_id(path, id).await
    }
}

impl<S: CoordinationStore + ?Sized, D: Dialer> Drop for ServiceDiscovery<S, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.reconciler.get() {
            handle.abort();
        }
    }
}
