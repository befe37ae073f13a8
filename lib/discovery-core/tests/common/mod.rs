#![allow(dead_code)]

use async_trait::async_trait;
use discovery_core::{DialError, Dialer};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connection handle produced by [`FakeDialer`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeConn {
    pub address: String,
    /// Distinguishes two dials of the same address
    pub serial: u64,
}

/// Dialer that never touches the network.
///
/// Addresses starting with `unreachable` fail, `slow` takes 200ms and
/// `hang` takes 10s; everything else succeeds immediately.
#[derive(Clone, Debug, Default)]
pub struct FakeDialer {
    dials: Arc<AtomicU64>,
}

impl FakeDialer {
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    type Conn = FakeConn;

    async fn dial(&self, address: &str, _timeout: Duration) -> Result<FakeConn, DialError> {
        let serial = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if address.starts_with("unreachable") {
            return Err(DialError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if address.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if address.starts_with("hang") {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        Ok(FakeConn {
            address: address.to_string(),
            serial,
        })
    }
}

pub fn address(conn: Option<FakeConn>) -> Option<String> {
    conn.map(|c| c.address)
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
