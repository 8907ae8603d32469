//! Integration tests for the file transfer engine's error paths and progress
//! bookkeeping. A full upload/download round trip needs a live SSH target;
//! these exercise what's reachable against an unconnected chain plus the
//! local filesystem.

use bastion_core::hop::accept_all_policy;
use bastion_core::{AuthMaterial, Chain, Hop, TransferEngine};
use std::sync::Arc;
use tokio::sync::mpsc;

fn unconnected_chain() -> Arc<Chain> {
    let hop = Hop::new(
        "a",
        "a",
        "198.51.100.1",
        22,
        "user",
        AuthMaterial::Password {
            secret: "x".into(),
        },
    );
    Arc::new(Chain::new(vec![hop], accept_all_policy()).unwrap())
}

#[tokio::test]
async fn test_upload_against_unconnected_chain_fails() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("payload.txt");
    tokio::fs::write(&file_path, b"hello world").await.unwrap();

    let engine = TransferEngine::new(unconnected_chain());
    let (tx, _rx) = mpsc::channel(16);

    let result = engine.upload_file(&file_path, "/remote/payload.txt", tx).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_download_against_unconnected_chain_fails() {
    let dir = tempfile::tempdir().unwrap();
    let local_path = dir.path().join("downloaded.txt");

    let engine = TransferEngine::new(unconnected_chain());
    let (tx, _rx) = mpsc::channel(16);

    let result = engine.download_file("/remote/payload.txt", &local_path, tx).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_upload_directory_reports_per_file_results() {
    let local = tempfile::tempdir().unwrap();
    tokio::fs::write(local.path().join("a.txt"), b"a").await.unwrap();
    tokio::fs::write(local.path().join("b.txt"), b"b").await.unwrap();

    let engine = TransferEngine::new(unconnected_chain());
    let (tx, _rx) = mpsc::channel(16);

    // mkdir -p over the unconnected chain fails first, so the whole call
    // surfaces an error rather than a partial per-file result list.
    let result = engine.upload_directory(local.path(), "/remote/dir", tx).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_upload_missing_local_file_is_an_io_error() {
    let engine = TransferEngine::new(unconnected_chain());
    let (tx, _rx) = mpsc::channel(16);

    let result = engine
        .upload_file(std::path::Path::new("/nonexistent/path"), "/remote/x", tx)
        .await;
    assert!(result.is_err());
}
