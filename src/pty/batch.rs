//! Batched writer: coalesces small writes destined for the
//! terminal transport (the WebSocket side) so a burst of single-byte PTY
//! reads doesn't turn into a WS message per byte.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

const MAX_BATCH_BYTES: usize = 64 * 1024;
const MAX_BATCH_DELAY: Duration = Duration::from_millis(5);

/// Accepts chunks on `rx` and forwards coalesced batches to `flush` once
/// either `MAX_BATCH_BYTES` is reached or `MAX_BATCH_DELAY` elapses since the
/// first buffered chunk.
pub async fn run<F, Fut>(mut rx: mpsc::Receiver<Vec<u8>>, mut flush: F)
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let mut batch: Vec<u8> = Vec::with_capacity(MAX_BATCH_BYTES);
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = match deadline {
            Some(d) => tokio::time::sleep_until(d),
            None => tokio::time::sleep(Duration::from_secs(3600)),
        };
        tokio::pin!(sleep);

        tokio::select! {
            chunk = rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + MAX_BATCH_DELAY);
                        }
                        batch.extend_from_slice(&chunk);
                        if batch.len() >= MAX_BATCH_BYTES {
                            if !flush(std::mem::take(&mut batch)).await {
                                return;
                            }
                            deadline = None;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            let _ = flush(std::mem::take(&mut batch)).await;
                        }
                        return;
                    }
                }
            }
            _ = &mut sleep, if deadline.is_some() => {
                if !batch.is_empty() {
                    if !flush(std::mem::take(&mut batch)).await {
                        return;
                    }
                }
                deadline = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn flushes_on_size_threshold() {
        let (tx, rx) = mpsc::channel(16);
        let flushed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let flushed_clone = flushed.clone();

        let handle = tokio::spawn(run(rx, move |batch| {
            let flushed = flushed_clone.clone();
            async move {
                flushed.lock().unwrap().push(batch);
                true
            }
        }));

        tx.send(vec![0u8; MAX_BATCH_BYTES]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
        handle.await.unwrap();

        assert_eq!(flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn flushes_small_writes_on_delay() {
        let (tx, rx) = mpsc::channel(16);
        let flushed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let flushed_clone = flushed.clone();

        let handle = tokio::spawn(run(rx, move |batch| {
            let flushed = flushed_clone.clone();
            async move {
                flushed.lock().unwrap().push(batch);
                true
            }
        }));

        tx.send(vec![1, 2, 3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
        handle.await.unwrap();

        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0], vec![1, 2, 3]);
    }
}
