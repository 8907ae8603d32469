//! Integration tests for the connection pool.

use bastion_core::hop::accept_all_policy;
use bastion_core::{AuthMaterial, ConnectionPool, Hop, PoolConfig};
use std::time::Duration;

fn hop(id: &str) -> Hop {
    Hop::new(
        id,
        id,
        "198.51.100.1",
        22,
        "user",
        AuthMaterial::Password {
            secret: "x".into(),
        },
    )
}

#[tokio::test]
async fn test_acquire_on_empty_hop_list_is_rejected() {
    let pool = ConnectionPool::new(PoolConfig::default(), accept_all_policy());
    let err = pool.acquire(Vec::new()).await.unwrap_err();
    assert_eq!(err.kind(), "chain-build");
}

#[tokio::test]
async fn test_acquire_against_unreachable_target_times_out() {
    let config = PoolConfig {
        acquire_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let pool = ConnectionPool::new(config, accept_all_policy());
    let err = pool.acquire(vec![hop("unreachable")]).await.unwrap_err();
    assert!(err.kind() == "pool-timeout" || err.kind() == "chain-build");
}

#[tokio::test]
async fn test_shutdown_drains_without_panicking() {
    let pool = ConnectionPool::new(PoolConfig::default(), accept_all_policy());
    pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_acquires_on_distinct_targets_do_not_deadlock() {
    let config = PoolConfig {
        acquire_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let pool = ConnectionPool::new(config, accept_all_policy());

    let mut handles = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let name = format!("unreachable-{i}");
        handles.push(tokio::spawn(async move {
            pool.acquire(vec![hop(&name)]).await
        }));
    }
    for handle in handles {
        let _ = handle.await.expect("task panicked");
    }
}
