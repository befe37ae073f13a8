mod common;

use common::{address, FakeDialer};
use discovery_core::{AddOutcome, KnownNames, ServicePath, ServicePool};
use std::sync::Arc;
use std::time::Duration;

fn open_pool() -> ServicePool<FakeDialer> {
    ServicePool::new(FakeDialer::default(), KnownNames::disabled()).expect("Failed to create pool")
}

async fn endpoint_keys(pool: &ServicePool<FakeDialer>, path: &str) -> Vec<String> {
    pool.snapshot()
        .await
        .into_iter()
        .find(|s| s.name.as_str() == path)
        .map(|s| s.endpoints.into_iter().map(|e| e.key).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_add_then_exact_lookup_returns_dialed_connection() {
    let pool = open_pool();
    assert_eq!(
        pool.add_service("/backends/snowflake/s1", "10.0.0.1:50051").await,
        AddOutcome::Added
    );

    let conn = pool
        .get_service_with_id("/backends/snowflake", "s1")
        .await
        .expect("endpoint should be registered");
    assert_eq!(conn.address, "10.0.0.1:50051");
    assert_eq!(conn.serial, 1);
}

#[tokio::test]
async fn test_duplicate_keys_are_never_stored() {
    let pool = open_pool();
    pool.add_service("/backends/echo/1", "A").await;
    pool.add_service("/backends/echo/2", "B").await;

    assert_eq!(pool.add_service("/backends/echo/1", "A").await, AddOutcome::Unchanged);
    assert_eq!(pool.endpoint_count("/backends/echo").await, 2);

    // A new address for an existing key replaces it where it stands
    assert_eq!(pool.add_service("/backends/echo/1", "A2").await, AddOutcome::Updated);
    assert_eq!(pool.endpoint_count("/backends/echo").await, 2);
    assert_eq!(
        endpoint_keys(&pool, "/backends/echo").await,
        vec!["/backends/echo/1", "/backends/echo/2"]
    );
    assert_eq!(
        address(pool.get_service_with_id("/backends/echo", "1").await),
        Some("A2".to_string())
    );
}

#[tokio::test]
async fn test_remove_keeps_relative_order() {
    let pool = open_pool();
    for (id, addr) in [("1", "A"), ("2", "B"), ("3", "C"), ("4", "D")] {
        pool.add_service(&format!("/backends/echo/{}", id), addr).await;
    }

    assert!(pool.remove_service("/backends/echo/2").await);
    assert_eq!(pool.get_service_with_id("/backends/echo", "2").await, None);
    assert_eq!(
        endpoint_keys(&pool, "/backends/echo").await,
        vec!["/backends/echo/1", "/backends/echo/3", "/backends/echo/4"]
    );

    // Removing again, or removing from an unknown service, is a no-op
    assert!(!pool.remove_service("/backends/echo/2").await);
    assert!(!pool.remove_service("/backends/nothing/1").await);
    assert!(!pool.remove_service("garbage").await);
}

#[tokio::test]
async fn test_round_robin_visits_each_client_once() {
    let pool = open_pool();
    for (id, addr) in [("1", "A"), ("2", "B"), ("3", "C")] {
        pool.add_service(&format!("/backends/echo/{}", id), addr).await;
    }

    let mut picked = Vec::new();
    for _ in 0..3 {
        picked.push(address(pool.get_service("/backends/echo").await).unwrap());
    }
    // The cursor is incremented before indexing, so the first pick is the second client
    assert_eq!(picked, vec!["B", "C", "A"]);

    let mut next_round = Vec::new();
    for _ in 0..3 {
        next_round.push(address(pool.get_service("/backends/echo").await).unwrap());
    }
    assert_eq!(next_round, picked);
}

#[tokio::test]
async fn test_lookups_on_unknown_or_empty_service_return_none() {
    let pool = open_pool();
    assert_eq!(pool.get_service("/backends/missing").await, None);
    assert_eq!(pool.get_service_with_id("/backends/missing", "1").await, None);

    pool.add_service("/backends/echo/1", "A").await;
    pool.remove_service("/backends/echo/1").await;
    assert!(pool.contains_service("/backends/echo").await);
    assert_eq!(pool.get_service("/backends/echo").await, None);
    assert_eq!(pool.get_service_with_id("/backends/echo", "1").await, None);
}

#[tokio::test]
async fn test_exact_lookup_does_not_fall_back() {
    let pool = open_pool();
    pool.add_service("/backends/echo/1", "A").await;
    assert_eq!(pool.get_service_with_id("/backends/echo", "2").await, None);
    assert_eq!(pool.get_service_with_id("/backends/echo", "").await, None);
}

#[tokio::test]
async fn test_name_check_drops_unknown_services() {
    let names = KnownNames::from_paths([ServicePath::parse("/backends/foo").unwrap()]);
    let pool = ServicePool::new(FakeDialer::default(), names).unwrap();

    assert_eq!(pool.add_service("/backends/bar/i1", "A").await, AddOutcome::Rejected);
    assert!(!pool.contains_service("/backends/bar").await);
    assert_eq!(pool.service_count().await, 0);

    assert_eq!(pool.add_service("/backends/foo/i1", "B").await, AddOutcome::Added);
    assert!(pool.contains_service("/backends/foo").await);
}

#[tokio::test]
async fn test_dial_failure_leaves_list_untouched() {
    let pool = open_pool();
    pool.add_service("/backends/echo/1", "A").await;

    assert_eq!(
        pool.add_service("/backends/echo/2", "unreachable:1").await,
        AddOutcome::DialFailed
    );
    assert_eq!(pool.endpoint_count("/backends/echo").await, 1);
    assert_eq!(pool.get_service_with_id("/backends/echo", "2").await, None);

    // The service record is still created for a failed first dial
    assert_eq!(
        pool.add_service("/backends/other/1", "unreachable:2").await,
        AddOutcome::DialFailed
    );
    assert!(pool.contains_service("/backends/other").await);
    assert_eq!(pool.get_service("/backends/other").await, None);

    let text = pool.metrics().gather().unwrap();
    assert!(text.contains("discovery_dial_failures_total{service=\"/backends/echo\"} 1"));
}

#[tokio::test]
async fn test_dial_timeout_is_bounded() {
    let pool = open_pool().with_dial_timeout(Duration::from_millis(50));

    let started = tokio::time::Instant::now();
    let outcome = pool.add_service("/backends/echo/1", "hang:1").await;
    assert_eq!(outcome, AddOutcome::DialFailed);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(pool.endpoint_count("/backends/echo").await, 0);
}

#[tokio::test]
async fn test_invalid_keys_are_ignored() {
    let pool = open_pool();
    assert_eq!(pool.add_service("no-slashes", "A").await, AddOutcome::InvalidKey);
    assert_eq!(pool.add_service("/backends/echo/", "A").await, AddOutcome::InvalidKey);
    assert_eq!(pool.service_count().await, 0);
}

#[tokio::test]
async fn test_lookups_are_not_blocked_by_slow_dials() {
    let pool = Arc::new(open_pool());
    pool.add_service("/backends/echo/1", "A").await;

    let adder = pool.clone();
    let slow_add =
        tokio::spawn(async move { adder.add_service("/backends/echo/2", "slow:1").await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let lookup = tokio::time::timeout(
        Duration::from_millis(100),
        pool.get_service_with_id("/backends/echo", "1"),
    )
    .await
    .expect("lookup blocked behind a dial");
    assert_eq!(address(lookup), Some("A".to_string()));

    assert_eq!(slow_add.await.unwrap(), AddOutcome::Added);
    assert_eq!(pool.endpoint_count("/backends/echo").await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_during_mutation() {
    let pool = Arc::new(open_pool());
    for i in 0..8 {
        pool.add_service(&format!("/backends/echo/{}", i), &format!("addr-{}", i))
            .await;
    }

    let mut readers = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        readers.push(tokio::spawn(async move {
            let mut hits = 0;
            for _ in 0..500 {
                if pool.get_service("/backends/echo").await.is_some() {
                    hits += 1;
                }
                tokio::task::yield_now().await;
            }
            hits
        }));
    }

    for i in 0..8 {
        pool.remove_service(&format!("/backends/echo/{}", i)).await;
        pool.add_service(&format!("/backends/echo/{}", i), &format!("addr-{}", i))
            .await;
    }

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }

    let keys = endpoint_keys(&pool, "/backends/echo").await;
    let mut unique = keys.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(keys.len(), 8);
    assert_eq!(unique.len(), 8);
}
