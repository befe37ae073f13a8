use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtcdError>;

#[derive(Error, Debug)]
pub enum EtcdError {
    #[error("No etcd endpoints configured")]
    NoEndpoints,

    #[error("Invalid etcd endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
