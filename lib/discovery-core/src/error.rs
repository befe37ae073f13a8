use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Invalid endpoint key: {0}")]
    InvalidKey(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a value node: {0}")]
    NotAValue(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failures reported by a coordination store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The requested watch index has been compacted out of the store's history.
    #[error("Event index cleared: requested {requested}, oldest available {oldest}")]
    EventIndexCleared { requested: u64, oldest: u64 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid store response: {0}")]
    InvalidResponse(String),
}

/// Failures while establishing a connection to an endpoint address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Dial to {0} timed out")]
    Timeout(String),

    #[error("Connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },
}
