//! etcd v2 keys API response bodies

use discovery_core::{Node, StoreError, StoreResponse, WatchEvent};
use serde::Deserialize;

/// etcd error code for a missing key
pub const ERROR_KEY_NOT_FOUND: u32 = 100;
/// etcd error code for a watch index older than the retained history
pub const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawNode {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    modified_index: u64,
}

impl From<RawNode> for Node {
    fn from(raw: RawNode) -> Self {
        Node {
            // The root node carries no key
            key: raw.key.unwrap_or_else(|| "/".to_string()),
            dir: raw.dir,
            value: raw.value.unwrap_or_default(),
            nodes: raw.nodes.into_iter().map(Node::from).collect(),
            modified_index: raw.modified_index,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawResponse {
    #[serde(default)]
    action: String,
    node: RawNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawError {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl RawError {
    fn into_store_error(self, requested: Option<u64>) -> StoreError {
        match self.error_code {
            ERROR_KEY_NOT_FOUND => StoreError::KeyNotFound(self.cause),
            ERROR_EVENT_INDEX_CLEARED => StoreError::EventIndexCleared {
                requested: requested.unwrap_or_default(),
                oldest: oldest_index(&self.cause).unwrap_or(self.index),
            },
            code => StoreError::InvalidResponse(format!(
                "etcd error {}: {} ({})",
                code, self.message, self.cause
            )),
        }
    }
}

// Cause looks like "the requested history has been cleared [1008/8]"
fn oldest_index(cause: &str) -> Option<u64> {
    let start = cause.rfind('[')? + 1;
    let end = cause[start..].find('/')? + start;
    cause[start..end].parse().ok()
}

fn error_body(status: u16, body: &[u8], requested: Option<u64>) -> StoreError {
    match serde_json::from_slice::<RawError>(body) {
        Ok(raw) => raw.into_store_error(requested),
        Err(_) => StoreError::InvalidResponse(format!(
            "HTTP {}: {}",
            status,
            String::from_utf8_lossy(body).trim()
        )),
    }
}

fn success_body(body: &[u8]) -> Result<RawResponse, StoreError> {
    serde_json::from_slice::<RawResponse>(body)
        .map_err(|e| StoreError::InvalidResponse(format!("malformed etcd response: {}", e)))
}

/// Decode the body of a read. `etcd_index` is the `X-Etcd-Index` header.
pub fn decode_read(
    status: u16,
    etcd_index: Option<u64>,
    body: &[u8],
) -> Result<StoreResponse, StoreError> {
    if !(200..300).contains(&status) {
        return Err(error_body(status, body, None));
    }
    let raw = success_body(body)?;
    let node = Node::from(raw.node);
    let index = etcd_index.unwrap_or(node.modified_index);
    Ok(StoreResponse { node, index })
}

/// Decode the body of a completed long-poll watch.
///
/// Deletions and expirations come back flagged as removed and without a
/// value.
pub fn decode_watch(
    status: u16,
    wait_index: Option<u64>,
    body: &[u8],
) -> Result<WatchEvent, StoreError> {
    if !(200..300).contains(&status) {
        return Err(error_body(status, body, wait_index));
    }
    let raw = success_body(body)?;
    let removed = matches!(
        raw.action.as_str(),
        "delete" | "expire" | "compareAndDelete"
    );
    let node = Node::from(raw.node);
    Ok(WatchEvent {
        key: node.key,
        value: if removed { String::new() } else { node.value },
        dir: node.dir,
        removed,
        index: node.modified_index,
    })
}
