//! Integration tests for the chain builder.
//!
//! These exercise state transitions and error paths that don't require a
//! real SSH server; full handshake coverage needs a live target and is out
//! of scope here.

use bastion_core::{AuthMaterial, Chain, ChainState, Hop};
use std::sync::Arc;

// =============================================================================
// Construction
// =============================================================================

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

fn policy() -> bastion_core::HostKeyPolicy {
    bastion_core::hop::accept_all_policy()
}

#[test]
fn test_rejects_empty_hop_list() {
    assert!(Chain::new(Vec::new(), policy()).is_err());
}

#[tokio::test]
async fn test_fresh_chain_is_unconnected() {
    let chain = Chain::new(vec![hop("a")], policy()).unwrap();
    assert_eq!(chain.state().await, ChainState::Unconnected);
}

// =============================================================================
// Disconnect / teardown
// =============================================================================

#[tokio::test]
async fn test_disconnect_before_connect_is_idempotent() {
    let chain = Chain::new(vec![hop("a")], policy()).unwrap();
    chain.disconnect().await.unwrap();
    chain.disconnect().await.unwrap();
    assert_eq!(chain.state().await, ChainState::Closed);
}

#[tokio::test]
async fn test_operations_on_closed_chain_fail() {
    let chain = Chain::new(vec![hop("a")], policy()).unwrap();
    chain.disconnect().await.unwrap();

    let err = chain.dial("example.test", 80).await.unwrap_err();
    assert_eq!(err.kind(), "chain-closed");

    let err = chain.new_session().await.unwrap_err();
    assert_eq!(err.kind(), "chain-closed");
}

// =============================================================================
// Connect against an unreachable target
// =============================================================================

#[tokio::test]
async fn test_connect_to_unreachable_host_fails_cleanly() {
    // TEST-NET-1, reserved for documentation; nothing listens there.
    let chain = Arc::new(Chain::new(vec![hop("unreachable")], policy()).unwrap());
    let result = chain.connect().await;
    assert!(result.is_err());
    assert_eq!(chain.state().await, ChainState::Unconnected);
}

// =============================================================================
// Concurrent disconnects
// =============================================================================

#[tokio::test]
async fn test_concurrent_disconnects_do_not_panic() {
    let chain = Arc::new(Chain::new(vec![hop("a")], policy()).unwrap());
    let mut handles = Vec::new();
    for _ in 0..10 {
        let chain = chain.clone();
        handles.push(tokio::spawn(async move { chain.disconnect().await }));
    }
    for handle in handles {
        handle.await.expect("task panicked").unwrap();
    }
    assert_eq!(chain.state().await, ChainState::Closed);
}
