//! Network profiler: times the cost of establishing and using a
//! hop chain, and caches the result per path for a TTL so comparing
//! candidate routes doesn't repeatedly pay for a full handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::chain::Chain;
use crate::hop::{Hop, HostKeyPolicy};

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Uniquely identifies a route for caching purposes: the target hop's name
/// plus the ordered via-list of intermediate hop names.
fn path_key(hops: &[Hop]) -> String {
    hops.iter()
        .map(|h| h.name.as_str())
        .collect::<Vec<_>>()
        .join(">")
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub path: String,
    pub success: bool,
    pub latency: Option<Duration>,
    pub error: Option<String>,
    /// Wall-clock time the probe ran, for display at a management endpoint.
    pub timestamp: DateTime<Utc>,
    /// Monotonic clock used for TTL expiry; wall-clock jumps (NTP, DST)
    /// don't affect cache freshness.
    expiry_clock: Instant,
}

impl ProbeReport {
    fn expired(&self, ttl: Duration) -> bool {
        self.expiry_clock.elapsed() >= ttl
    }
}

pub struct NetworkProfiler {
    policy: HostKeyPolicy,
    ttl: Duration,
    cache: RwLock<HashMap<String, ProbeReport>>,
}

impl NetworkProfiler {
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            ttl: DEFAULT_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Probe a path: `Connect` → `Execute("echo ping")` → `Disconnect`,
    /// timed as one unit. Cached results younger than the TTL are returned
    /// without re-probing.
    pub async fn probe(&self, hops: Vec<Hop>) -> ProbeReport {
        let key = path_key(&hops);

        if let Some(cached) = self.cache.read().await.get(&key) {
            if !cached.expired(self.ttl) {
                return cached.clone();
            }
        }

        let report = self.run_probe(key.clone(), hops).await;
        self.cache.write().await.insert(key, report.clone());
        report
    }

    async fn run_probe(&self, path: String, hops: Vec<Hop>) -> ProbeReport {
        let start = Instant::now();

        let result: crate::error::Result<()> = async {
            let chain = Chain::new(hops, self.policy.clone())?;
            chain.connect().await?;
            let outcome = chain.execute("echo ping").await;
            let _ = chain.disconnect().await;
            outcome?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => ProbeReport {
                path,
                success: true,
                latency: Some(start.elapsed()),
                error: None,
                timestamp: Utc::now(),
                expiry_clock: Instant::now(),
            },
            Err(e) => ProbeReport {
                path,
                success: false,
                latency: None,
                error: Some(e.user_message()),
                timestamp: Utc::now(),
                expiry_clock: Instant::now(),
            },
        }
    }

    /// Probe two paths and return both reports, in order.
    pub async fn compare_paths(&self, a: Vec<Hop>, b: Vec<Hop>) -> (ProbeReport, ProbeReport) {
        tokio::join!(self.probe(a), self.probe(b))
    }

    /// Pick the lowest-latency successful report among several candidate
    /// paths. An error if none of the candidates succeeded.
    pub async fn best_path(&self, candidates: Vec<Vec<Hop>>) -> crate::error::Result<ProbeReport> {
        let mut reports = Vec::with_capacity(candidates.len());
        for hops in candidates {
            reports.push(self.probe(hops).await);
        }

        reports
            .into_iter()
            .filter(|r| r.success)
            .min_by_key(|r| r.latency.unwrap_or(Duration::MAX))
            .ok_or_else(|| crate::error::CoreError::Other(anyhow::anyhow!("no path probed successfully")))
    }

    pub async fn invalidate(&self, hops: &[Hop]) {
        self.cache.write().await.remove(&path_key(hops));
    }
}
