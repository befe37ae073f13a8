//! In-process coordination store
//!
//! Keeps leaves in an ordered map, derives directories from key prefixes and
//! records every mutation in a history so watchers can resume from an index.
//! `compact` and `set_available` simulate history loss and outages.

use crate::store::{CoordinationStore, Node, StoreResponse, StoreResult, WatchEvent, Watcher};
use crate::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug)]
struct Inner {
    leaves: BTreeMap<String, (String, u64)>,
    dirs: BTreeMap<String, u64>,
    index: u64,
    history: Vec<WatchEvent>,
    // Watches must start at or after this index
    oldest: u64,
    available: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            leaves: BTreeMap::new(),
            dirs: BTreeMap::new(),
            index: 0,
            history: Vec::new(),
            oldest: 1,
            available: true,
        }
    }
}

fn child_prefix(key: &str) -> String {
    if key == "/" {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

fn is_under(key: &str, root: &str) -> bool {
    key == root || key.starts_with(&child_prefix(root))
}

impl Inner {
    fn check_available(&self) -> StoreResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    fn is_dir(&self, key: &str) -> bool {
        let prefix = child_prefix(key);
        key == "/"
            || self.dirs.contains_key(key)
            || self.leaves.keys().any(|k| k.starts_with(&prefix))
            || self.dirs.keys().any(|k| k.starts_with(&prefix))
    }

    fn build(&self, key: &str, recursive: bool, descend: bool) -> StoreResult<Node> {
        if let Some((value, modified)) = self.leaves.get(key) {
            return Ok(Node::leaf(key, value.clone(), *modified));
        }
        if !self.is_dir(key) {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }

        let modified = self.dirs.get(key).copied().unwrap_or_default();
        if !descend {
            return Ok(Node::directory(key, Vec::new(), modified));
        }

        let prefix = child_prefix(key);
        let children: BTreeSet<String> = self
            .leaves
            .keys()
            .chain(self.dirs.keys())
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|segment| !segment.is_empty())
            .map(|segment| format!("{}{}", prefix, segment))
            .collect();

        let nodes = children
            .iter()
            .map(|child| self.build(child, recursive, recursive))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Node::directory(key, nodes, modified))
    }

    fn record(&mut self, key: &str, value: String, dir: bool, removed: bool) -> u64 {
        self.index += 1;
        self.history.push(WatchEvent {
            key: key.to_string(),
            value,
            dir,
            removed,
            index: self.index,
        });
        self.index
    }
}

/// Coordination store held entirely in memory
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a leaf value, creating or updating it. Returns the new store index.
    pub async fn put(&self, key: &str, value: &str) -> u64 {
        let mut inner = self.inner.lock().await;
        let index = inner.record(key, value.to_string(), false, false);
        inner.leaves.insert(key.to_string(), (value.to_string(), index));
        drop(inner);
        self.changed.notify_waiters();
        index
    }

    /// Create an empty directory.
    pub async fn mkdir(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock().await;
        let index = inner.record(key, String::new(), true, false);
        inner.dirs.insert(key.to_string(), index);
        drop(inner);
        self.changed.notify_waiters();
        index
    }

    /// Delete a leaf. Returns false if it did not exist.
    pub async fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.leaves.remove(key).is_none() {
            return false;
        }
        inner.record(key, String::new(), false, true);
        drop(inner);
        self.changed.notify_waiters();
        true
    }

    /// Delete a directory and everything below it as a single change.
    /// Returns false if it did not exist.
    pub async fn delete_dir(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.leaves.contains_key(key) || !inner.is_dir(key) {
            return false;
        }
        inner.leaves.retain(|k, _| !is_under(k, key));
        inner.dirs.retain(|k, _| !is_under(k, key));
        inner.record(key, String::new(), true, true);
        drop(inner);
        self.changed.notify_waiters();
        true
    }

    /// Drop all recorded history. Watches resuming from an earlier index
    /// fail with [`StoreError::EventIndexCleared`].
    pub async fn compact(&self) {
        let mut inner = self.inner.lock().await;
        inner.history.clear();
        inner.oldest = inner.index + 1;
    }

    /// Simulate an outage: while unavailable every read and watch fails.
    pub async fn set_available(&self, available: bool) {
        self.inner.lock().await.available = available;
        self.changed.notify_waiters();
    }

    pub async fn index(&self) -> u64 {
        self.inner.lock().await.index
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<StoreResponse> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let node = inner.build(key, false, true)?;
        Ok(StoreResponse {
            node,
            index: inner.index,
        })
    }

    async fn get_recursive(&self, key: &str) -> StoreResult<StoreResponse> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let node = inner.build(key, true, true)?;
        Ok(StoreResponse {
            node,
            index: inner.index,
        })
    }

    async fn watcher(&self, key: &str, after_index: Option<u64>) -> StoreResult<Box<dyn Watcher>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let next_index = after_index.unwrap_or(inner.index) + 1;
        Ok(Box::new(MemoryWatcher {
            store: self.clone(),
            root: key.to_string(),
            next_index,
        }))
    }
}

struct MemoryWatcher {
    store: MemoryStore,
    root: String,
    next_index: u64,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> StoreResult<WatchEvent> {
        loop {
            let notified = self.store.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.store.inner.lock().await;
                inner.check_available()?;
                if self.next_index < inner.oldest {
                    return Err(StoreError::EventIndexCleared {
                        requested: self.next_index,
                        oldest: inner.oldest,
                    });
                }

                let found = inner
                    .history
                    .iter()
                    .find(|e| e.index >= self.next_index && is_under(&e.key, &self.root));
                if let Some(event) = found {
                    self.next_index = event.index + 1;
                    return Ok(event.clone());
                }
                self.next_index = self.next_index.max(inner.index + 1);
            }

            notified.await;
        }
    }
}
