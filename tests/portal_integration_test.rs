//! Integration tests for the portal's auth model and wire handshake.
//!
//! A full TLS+mux round trip needs a certificate pair to stand up a real
//! listener; these exercise the token/allow-list authorization logic and
//! the handshake framing, which is what's reachable without one.

use bastion_core::config::{host_allowed, StaticConfig, TokenEntry};
use bastion_core::portal::protocol::{read_frame, write_frame, Handshake, HandshakeReply};
use bastion_core::ConfigRepository;

fn token(allow_list: &[&str]) -> TokenEntry {
    TokenEntry {
        token: "tok-1".into(),
        allow_list: allow_list.iter().map(|s| s.to_string()).collect(),
        max_mappings: None,
    }
}

#[test]
fn test_unknown_token_does_not_resolve() {
    let config = StaticConfig::new().with_token(token(&["db.internal"]));
    assert!(config.resolve_token("nope").is_none());
}

#[test]
fn test_known_token_resolves_and_checks_allow_list() {
    let config = StaticConfig::new().with_token(token(&["db.internal", "10.0.0.0/8"]));
    let entry = config.resolve_token("tok-1").unwrap();

    assert!(host_allowed(&entry, "db.internal"));
    assert!(host_allowed(&entry, "10.1.2.3"));
    assert!(!host_allowed(&entry, "evil.example.com"));
}

#[tokio::test]
async fn test_handshake_denied_reply_roundtrips() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let handshake = Handshake {
        token: "bad-token".into(),
        remote_host: "db.internal".into(),
        remote_port: 5432,
    };
    write_frame(&mut client, &handshake).await.unwrap();

    let received: Handshake = read_frame(&mut server).await.unwrap();
    assert_eq!(received.token, "bad-token");

    write_frame(&mut server, &HandshakeReply::denied("unknown token")).await.unwrap();
    let reply: HandshakeReply = read_frame(&mut client).await.unwrap();
    assert!(!reply.success);
    assert_eq!(reply.error.as_deref(), Some("unknown token"));
}

#[tokio::test]
async fn test_handshake_ok_reply_roundtrips() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    write_frame(&mut client, &Handshake {
        token: "tok-1".into(),
        remote_host: "db.internal".into(),
        remote_port: 5432,
    })
    .await
    .unwrap();
    let _: Handshake = read_frame(&mut server).await.unwrap();

    write_frame(&mut server, &HandshakeReply::ok()).await.unwrap();
    let reply: HandshakeReply = read_frame(&mut client).await.unwrap();
    assert!(reply.success);
    assert!(reply.error.is_none());
}
