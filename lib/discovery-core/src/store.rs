//! Coordination store abstraction
//!
//! The store exposes hierarchical keys, recursive listing and a recursive
//! change feed. Each [`Watcher::next`] call may fail on its own; callers
//! decide whether to reissue it.

use crate::StoreError;
use async_trait::async_trait;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A key or directory in the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub dir: bool,
    /// Empty for directories and deleted keys.
    pub value: String,
    /// Children, populated for directories (recursively on recursive reads).
    pub nodes: Vec<Node>,
    pub modified_index: u64,
}

impl Node {
    pub fn leaf(key: impl Into<String>, value: impl Into<String>, modified_index: u64) -> Self {
        Self {
            key: key.into(),
            dir: false,
            value: value.into(),
            nodes: Vec::new(),
            modified_index,
        }
    }

    pub fn directory(key: impl Into<String>, nodes: Vec<Node>, modified_index: u64) -> Self {
        Self {
            key: key.into(),
            dir: true,
            value: String::new(),
            nodes,
            modified_index,
        }
    }
}

/// Result of a read: the node plus the store-wide index at read time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreResponse {
    pub node: Node,
    pub index: u64,
}

/// One change delivered by a [`Watcher`]. Deletions carry an empty value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: String,
    pub dir: bool,
    /// Set when the node was deleted or expired
    pub removed: bool,
    pub index: u64,
}

/// What a [`WatchEvent`] means for the pool.
#[derive(Debug, PartialEq, Eq)]
pub enum Change<'a> {
    Upsert { key: &'a str, address: &'a str },
    Remove { key: &'a str },
    /// A whole directory and everything below it went away
    RemoveDirectory { key: &'a str },
    Ignore,
}

impl WatchEvent {
    pub fn change(&self) -> Change<'_> {
        if self.dir {
            if self.removed {
                Change::RemoveDirectory { key: &self.key }
            } else {
                Change::Ignore
            }
        } else if self.removed || self.value.is_empty() {
            Change::Remove { key: &self.key }
        } else {
            Change::Upsert {
                key: &self.key,
                address: &self.value,
            }
        }
    }
}

/// Blocking iterator over changes below a key.
#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next change. An error does not poison the watcher but
    /// callers usually open a fresh one.
    async fn next(&mut self) -> StoreResult<WatchEvent>;
}

/// Read and watch access to a hierarchical key/value store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single node without descending into directories.
    async fn get(&self, key: &str) -> StoreResult<StoreResponse>;

    /// Read a node and its whole subtree.
    async fn get_recursive(&self, key: &str) -> StoreResult<StoreResponse>;

    /// Open a recursive watch below `key`, delivering events with an index
    /// greater than `after_index`, or only future events when `None`.
    async fn watcher(&self, key: &str, after_index: Option<u64>) -> StoreResult<Box<dyn Watcher>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value: &str, dir: bool) -> WatchEvent {
        WatchEvent {
            key: "/backends/echo/1".to_string(),
            value: value.to_string(),
            dir,
            removed: false,
            index: 7,
        }
    }

    #[test]
    fn test_change_classification() {
        assert_eq!(event("", true).change(), Change::Ignore);
        assert_eq!(event("10.0.0.1:50051", true).change(), Change::Ignore);
        assert_eq!(
            event("", false).change(),
            Change::Remove { key: "/backends/echo/1" }
        );
        assert_eq!(
            event("10.0.0.1:50051", false).change(),
            Change::Upsert {
                key: "/backends/echo/1",
                address: "10.0.0.1:50051"
            }
        );
    }

    #[test]
    fn test_removed_directory() {
        let mut deleted = event("", true);
        deleted.key = "/backends/echo".to_string();
        deleted.removed = true;
        assert_eq!(
            deleted.change(),
            Change::RemoveDirectory { key: "/backends/echo" }
        );

        let mut expired = event("10.0.0.1:50051", false);
        expired.removed = true;
        assert_eq!(
            expired.change(),
            Change::Remove { key: "/backends/echo/1" }
        );
    }
}
