//! Connection pool: reuses already-connected [`Chain`]s keyed by
//! the target hop's `user@host:port`, so the port forwarder, PTY sessions,
//! and file transfers don't each pay for a fresh multi-hop handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::chain::Chain;
use crate::error::{CoreError, Result};
use crate::hop::{Hop, HostKeyPolicy};
use crate::lifecycle::Lifecycle;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_per_key: usize,
    pub max_idle_per_key: usize,
    pub acquire_timeout: Duration,
    /// How long an idle, unused chain is kept before the reaper closes it.
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 4,
            max_idle_per_key: 2,
            acquire_timeout: Duration::from_secs(10),
            idle_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
        }
    }
}

struct Entry {
    chain: Arc<Chain>,
    in_use: Arc<AtomicBool>,
    last_released: Instant,
}

/// Key a pooled chain by the fingerprint of its target hop, not the whole
/// hop list; two chains that end at the same box are interchangeable even
/// if one caller routed through a different set of jump hosts.
fn fingerprint(target: &Hop) -> String {
    format!("{}@{}:{}", target.username, target.host, target.port)
}

pub struct ConnectionPool {
    config: PoolConfig,
    policy: HostKeyPolicy,
    entries: Mutex<HashMap<String, Vec<Entry>>>,
    acquire_errors: AtomicU64,
    lifecycle: Lifecycle,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, policy: HostKeyPolicy) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            policy,
            entries: Mutex::new(HashMap::new()),
            acquire_errors: AtomicU64::new(0),
            lifecycle: Lifecycle::new(),
        });
        pool.clone().spawn_reaper();
        pool
    }

    fn spawn_reaper(self: Arc<Self>) {
        let token = self.lifecycle.child_token();
        let pool = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.reap_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => pool.reap().await,
                }
            }
        });
        tokio::spawn({
            let lifecycle = self.lifecycle.clone();
            async move { lifecycle.track(handle).await }
        });
    }

    async fn reap(&self) {
        let mut entries = self.entries.lock().await;
        for (key, slots) in entries.iter_mut() {
            let idle_ttl = self.config.idle_ttl;
            let max_idle = self.config.max_idle_per_key;

            let mut idle_indices: Vec<usize> = slots
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.in_use.load(Ordering::Acquire))
                .map(|(i, _)| i)
                .collect();

            // Oldest-released first, so we keep the freshest idle chains.
            idle_indices.sort_by_key(|&i| slots[i].last_released);

            let excess = idle_indices.len().saturating_sub(max_idle);
            let mut to_remove: Vec<usize> = idle_indices[..excess].to_vec();
            to_remove.extend(idle_indices[excess..].iter().filter(|&&i| {
                slots[i].last_released.elapsed() > idle_ttl
            }));
            to_remove.sort_unstable();
            to_remove.dedup();

            for &i in to_remove.iter().rev() {
                let entry = slots.remove(i);
                tracing::debug!(key = %key, "reaping idle pooled chain");
                let _ = entry.chain.disconnect().await;
            }
        }
        entries.retain(|_, slots| !slots.is_empty());
    }

    /// Enforce "idle count <= max_idle_per_key" for one key right after a
    /// release, rather than waiting for the next reaper tick. Closes the
    /// oldest-released idle entries first.
    async fn enforce_idle_cap(&self, key: &str) {
        let max_idle = self.config.max_idle_per_key;
        let mut entries = self.entries.lock().await;
        let Some(slots) = entries.get_mut(key) else {
            return;
        };

        let mut idle_indices: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_use.load(Ordering::Acquire))
            .map(|(i, _)| i)
            .collect();
        idle_indices.sort_by_key(|&i| slots[i].last_released);

        let excess = idle_indices.len().saturating_sub(max_idle);
        for &i in idle_indices[..excess].iter().rev() {
            let entry = slots.remove(i);
            tracing::debug!(key = %key, "closing excess idle pooled chain on release");
            let _ = entry.chain.disconnect().await;
        }
        if slots.is_empty() {
            entries.remove(key);
        }
    }

    /// Acquire a chain for `hops`, reusing an idle pooled chain whose target
    /// matches the last hop's fingerprint when one is free, otherwise
    /// dialing a fresh one (bounded by `max_per_key`).
    pub async fn acquire(self: &Arc<Self>, hops: Vec<Hop>) -> Result<PoolGuard> {
        let key = fingerprint(hops.last().ok_or_else(|| {
            CoreError::chain_build("<empty>", "chain must have at least one hop")
        })?);

        let result = tokio::time::timeout(self.config.acquire_timeout, self.acquire_inner(key.clone(), hops)).await;

        match result {
            Ok(Ok(guard)) => Ok(guard),
            Ok(Err(e)) => {
                self.acquire_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.acquire_errors.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::PoolTimeout(self.config.acquire_timeout))
            }
        }
    }

    async fn acquire_inner(self: &Arc<Self>, key: String, hops: Vec<Hop>) -> Result<PoolGuard> {
        loop {
            let mut entries = self.entries.lock().await;
            let slots = entries.entry(key.clone()).or_default();

            if let Some(entry) = slots.iter().find(|e| !e.in_use.load(Ordering::Acquire)) {
                entry.in_use.store(true, Ordering::Release);
                return Ok(PoolGuard {
                    chain: entry.chain.clone(),
                    in_use: entry.in_use.clone(),
                    pool: self.clone(),
                    key,
                });
            }

            if slots.len() < self.config.max_per_key {
                break;
            }

            drop(entries);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        // Capacity was available; dial outside the lock so other keys aren't
        // blocked for the duration of the handshake. Two acquirers racing on
        // the same key can both pass the check above and briefly exceed
        // max_per_key by one; the next release/reap cycle settles it back.
        let chain = Arc::new(Chain::new(hops, self.policy.clone())?);
        chain.connect().await?;

        let in_use = Arc::new(AtomicBool::new(true));
        let mut entries = self.entries.lock().await;
        entries.entry(key.clone()).or_default().push(Entry {
            chain: chain.clone(),
            in_use: in_use.clone(),
            last_released: Instant::now(),
        });

        Ok(PoolGuard {
            chain,
            in_use,
            pool: self.clone(),
            key,
        })
    }

    pub fn acquire_errors(&self) -> u64 {
        self.acquire_errors.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
        let mut entries = self.entries.lock().await;
        for (_, slots) in entries.drain() {
            for entry in slots {
                let _ = entry.chain.disconnect().await;
            }
        }
    }
}

/// A chain on loan from the pool. Marks itself free again on drop.
pub struct PoolGuard {
    chain: Arc<Chain>,
    in_use: Arc<AtomicBool>,
    pool: Arc<ConnectionPool>,
    key: String,
}

impl std::ops::Deref for PoolGuard {
    type Target = Chain;

    fn deref(&self) -> &Chain {
        &self.chain
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
        let pool = self.pool.clone();
        let key = self.key.clone();
        let in_use = self.in_use.clone();
        tokio::spawn(async move {
            {
                let mut entries = pool.entries.lock().await;
                if let Some(slots) = entries.get_mut(&key) {
                    if let Some(slot) = slots.iter_mut().find(|e| Arc::ptr_eq(&e.in_use, &in_use)) {
                        slot.last_released = Instant::now();
                    }
                }
            }
            // Keep the post-release idle count within max_idle_per_key instead
            // of leaving the overshoot for the next reap() tick.
            pool.enforce_idle_cap(&key).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::{accept_all_policy, AuthMaterial};

    fn hop(host: &str) -> Hop {
        Hop::new(
            host,
            host,
            host,
            22,
            "user",
            AuthMaterial::Password {
                secret: "x".into(),
            },
        )
    }

    #[test]
    fn fingerprint_ignores_intermediate_hops() {
        let target = hop("db.internal");
        assert_eq!(fingerprint(&target), "user@db.internal:22");
    }

    #[tokio::test]
    async fn acquire_on_empty_hops_is_rejected() {
        let pool = ConnectionPool::new(PoolConfig::default(), accept_all_policy());
        let err = pool.acquire(Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), "chain-build");
    }

    #[tokio::test]
    async fn acquire_times_out_against_an_unreachable_host() {
        let config = PoolConfig {
            acquire_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let pool = ConnectionPool::new(config, accept_all_policy());
        // TEST-NET-1 (RFC 5737): guaranteed non-routable, so the handshake
        // itself times out rather than getting a fast connection-refused.
        let unreachable = hop("192.0.2.1");
        let err = pool.acquire(vec![unreachable]).await.unwrap_err();
        assert!(matches!(err, CoreError::PoolTimeout(_)) || err.kind() == "chain-build");
    }
}
