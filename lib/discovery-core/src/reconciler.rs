//! Change-feed reconciliation
//!
//! A single background task applies store changes to the pool in the order
//! they are delivered. When the feed fails it backs off and re-subscribes,
//! forever. Whether missed history is recovered depends on the
//! [`ResyncPolicy`].

use crate::bootstrap;
use crate::config::{ResyncPolicy, WatchBackoff};
use crate::dial::Dialer;
use crate::endpoint::{EndpointKey, ServicePath};
use crate::metrics::{EVENT_IGNORED, EVENT_REJECTED, EVENT_REMOVE, EVENT_UPSERT};
use crate::registry::{AddOutcome, ServicePool};
use crate::store::{Change, CoordinationStore, WatchEvent};
use crate::StoreError;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where the next watch subscription starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchStart {
    /// Deliver events with an index greater than this one
    After(u64),
    /// Deliver only events that happen from now on
    Now,
    /// Resync from a full snapshot first, then watch after its index
    Resync,
}

pub struct Reconciler<S: ?Sized, D: Dialer> {
    store: Arc<S>,
    pool: Arc<ServicePool<D>>,
    directory: String,
    backoff: WatchBackoff,
    resync: ResyncPolicy,
}

impl<S, D> Reconciler<S, D>
where
    S: CoordinationStore + ?Sized + 'static,
    D: Dialer,
{
    pub fn new(store: Arc<S>, pool: Arc<ServicePool<D>>, directory: impl Into<String>) -> Self {
        Self {
            store,
            pool,
            directory: directory.into(),
            backoff: WatchBackoff::default(),
            resync: ResyncPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: WatchBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_resync(mut self, resync: ResyncPolicy) -> Self {
        self.resync = resync;
        self
    }

    /// Run the reconciliation loop on the tokio runtime.
    pub fn spawn(self, start: WatchStart) -> JoinHandle<()> {
        tokio::spawn(self.run(start))
    }

    /// Watch the service directory and apply changes until the task is aborted.
    pub async fn run(self, start: WatchStart) {
        let mut start = start;
        let mut failures: u32 = 0;

        loop {
            let after = match start {
                WatchStart::After(index) => Some(index),
                WatchStart::Now => None,
                WatchStart::Resync => {
                    let resynced =
                        bootstrap::resync(self.store.as_ref(), &self.pool, &self.directory).await;
                    match resynced {
                        Ok(index) => Some(index),
                        Err(e) => {
                            error!("Resync of {} failed: {}", self.directory, e);
                            self.pause(&mut failures).await;
                            continue;
                        }
                    }
                }
            };

            let mut watcher = match self.store.watcher(&self.directory, after).await {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!("Failed to watch {}: {}", self.directory, e);
                    self.pool.metrics().watch_errors_total.inc();
                    start = self.restart_point(&e, after);
                    self.pause(&mut failures).await;
                    continue;
                }
            };
            info!("Watching {} for changes", self.directory);

            let mut last_index = after;
            loop {
                match watcher.next().await {
                    Ok(event) => {
                        failures = 0;
                        last_index = Some(event.index);
                        self.apply(&event).await;
                    }
                    Err(e) => {
                        warn!("Watch on {} failed: {}", self.directory, e);
                        self.pool.metrics().watch_errors_total.inc();
                        start = self.restart_point(&e, last_index);
                        break;
                    }
                }
            }

            self.pause(&mut failures).await;
        }
    }

    /// Apply one change event to the pool.
    ///
    /// Only `<directory>/<service>/<instance>` leaves are endpoints; other
    /// keys below the directory, such as the names key, are ignored.
    pub async fn apply(&self, event: &WatchEvent) {
        let metrics = self.pool.metrics();
        match event.change() {
            Change::Ignore => {
                debug!("Ignoring directory event: {}", event.key);
                metrics.record_event(EVENT_IGNORED);
            }
            Change::Upsert { key, address } => {
                if !self.is_endpoint(key) {
                    metrics.record_event(EVENT_IGNORED);
                    return;
                }
                debug!("Node add: {} {}", key, address);
                let outcome = self.pool.add_service(key, address).await;
                let kind = match outcome {
                    AddOutcome::Rejected | AddOutcome::InvalidKey => EVENT_REJECTED,
                    _ => EVENT_UPSERT,
                };
                metrics.record_event(kind);
            }
            Change::Remove { key } => {
                if !self.is_endpoint(key) {
                    metrics.record_event(EVENT_IGNORED);
                    return;
                }
                debug!("Node delete: {}", key);
                self.pool.remove_service(key).await;
                metrics.record_event(EVENT_REMOVE);
            }
            Change::RemoveDirectory { key } => {
                if key == self.directory.trim_end_matches('/') {
                    let removed = self.pool.retain_keys(&HashSet::new()).await;
                    warn!("Service directory {} deleted, {} endpoints removed", key, removed);
                } else if ServicePath::parse_under(&self.directory, key).is_ok() {
                    let removed = self.pool.clear_service(key).await;
                    debug!("Service delete: {}, {} endpoints removed", key, removed);
                } else {
                    debug!("Ignoring directory delete: {}", key);
                    metrics.record_event(EVENT_IGNORED);
                    return;
                }
                metrics.record_event(EVENT_REMOVE);
            }
        }
    }

    fn is_endpoint(&self, key: &str) -> bool {
        match EndpointKey::parse_under(&self.directory, key) {
            Ok(_) => true,
            Err(_) => {
                debug!("Ignoring {}: not an endpoint of {}", key, self.directory);
                false
            }
        }
    }

    fn restart_point(&self, error: &StoreError, last_index: Option<u64>) -> WatchStart {
        match self.resync {
            ResyncPolicy::Full => WatchStart::Resync,
            ResyncPolicy::Never => match (error, last_index) {
                (StoreError::EventIndexCleared { .. }, _) => {
                    warn!(
                        "History of {} was compacted; changes since index {:?} are lost",
                        self.directory, last_index
                    );
                    WatchStart::Now
                }
                (_, Some(index)) => WatchStart::After(index),
                (_, None) => WatchStart::Now,
            },
        }
    }

    async fn pause(&self, failures: &mut u32) {
        let delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        debug!("Re-subscribing to {} in {:?}", self.directory, delay);
        tokio::time::sleep(delay).await;
    }
}
