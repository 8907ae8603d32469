//! Root cancellation and close-outside-in teardown ordering.
//!
//! Every long-running component (forwarder, PTY session, pool, portal
//! client/server) derives its cancellation from a [`Lifecycle`] created at
//! construction. `shutdown()` is the one place the "close outside-in" rule
//! is encoded: stop accepting new work, then cancel in-flight work, then let
//! the caller tear down shared resources (chains, pool) afterwards.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared cancellation handle plus a join registry for spawned tasks, so
/// `shutdown()` can block until everything this component spawned has
/// actually exited.
#[derive(Clone)]
pub struct Lifecycle {
    token: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A child token that is cancelled when this lifecycle shuts down, but
    /// can also be cancelled independently (e.g. a single connection's
    /// failure shouldn't cancel the whole forwarder).
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Track a spawned task so `shutdown()` can wait for it.
    pub async fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().await.push(handle);
    }

    /// Signal cancellation and wait for every tracked task to finish.
    /// Idempotent: a second call observes an already-cancelled token and an
    /// already-drained task list.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn shutdown_cancels_token_and_waits() {
        let lifecycle = Lifecycle::new();
        let ran_to_completion = Arc::new(AtomicBool::new(false));

        let token = lifecycle.child_token();
        let flag = ran_to_completion.clone();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        lifecycle.track(handle).await;

        lifecycle.shutdown().await;
        assert!(ran_to_completion.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let lifecycle = Lifecycle::new();
        lifecycle.shutdown().await;
        lifecycle.shutdown().await;
        assert!(lifecycle.is_cancelled());
    }
}
