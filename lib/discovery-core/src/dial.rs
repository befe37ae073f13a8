//! Connection establishment for discovered endpoints

use crate::DialError;
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Turns an advertised address into a connection handle.
///
/// Handles are cloned out of the pool on every lookup, so they should be
/// cheap to clone (a shared channel, an `Arc`, ...).
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    /// Establish a connection to `address`, giving up after `timeout`.
    async fn dial(&self, address: &str, timeout: Duration) -> Result<Self::Conn, DialError>;
}

/// Dials gRPC endpoints as lazily-connected `tonic` channels.
///
/// The returned channel connects on first use, so `dial` returns as soon as
/// the address has been validated.
#[derive(Clone, Debug, Default)]
pub struct GrpcDialer {
    tcp_keepalive: Option<Duration>,
}

impl GrpcDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable TCP keepalive on the underlying sockets
    pub fn with_tcp_keepalive(mut self, keepalive: Duration) -> Self {
        self.tcp_keepalive = Some(keepalive);
        self
    }

    fn endpoint_uri(address: &str) -> String {
        if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }
}

#[async_trait]
impl Dialer for GrpcDialer {
    type Conn = Channel;

    async fn dial(&self, address: &str, timeout: Duration) -> Result<Channel, DialError> {
        let endpoint = Endpoint::from_shared(Self::endpoint_uri(address))
            .map_err(|e| DialError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(timeout)
            .tcp_keepalive(self.tcp_keepalive);

        debug!("Created lazy gRPC channel to {}", address);
        Ok(endpoint.connect_lazy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(GrpcDialer::endpoint_uri("10.0.0.1:50051"), "http://10.0.0.1:50051");
        assert_eq!(
            GrpcDialer::endpoint_uri("https://echo.internal:443"),
            "https://echo.internal:443"
        );
    }

    #[tokio::test]
    async fn test_dial_is_lazy() {
        // Nothing listens on port 1; a lazy channel is still returned immediately.
        let dialer = GrpcDialer::new();
        let result = dialer.dial("127.0.0.1:1", Duration::from_millis(50)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_dial_rejects_invalid_address() {
        let dialer = GrpcDialer::new();
        let result = dialer.dial("not a uri", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(DialError::InvalidAddress { .. })));
    }
}
