//! Adaptive buffer sizing for PTY I/O: read/write buffers start
//! at a fixed baseline and are resized periodically based on measured
//! throughput, so a quiet SSH session doesn't hold a large buffer and a
//! `cat largefile` doesn't thrash on a small one.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const BASELINE_READ: usize = 32 * 1024;
const BASELINE_WRITE: usize = 64 * 1024;
const MIN_SIZE: usize = 4 * 1024;
const MAX_SIZE: usize = 256 * 1024;
const ADJUST_INTERVAL: Duration = Duration::from_secs(5);

const HIGH_THROUGHPUT: u64 = 10 * 1024 * 1024; // bytes/sec
const MEDIUM_THROUGHPUT: u64 = 1024 * 1024;
const LOW_THROUGHPUT: u64 = 100 * 1024;

/// Tracks bytes moved through a PTY session and periodically recommends a
/// new buffer size.
pub struct AdaptiveBuffer {
    current_size: AtomicUsize,
    bytes_since_adjust: AtomicU64,
    last_adjust: std::sync::Mutex<Instant>,
}

impl AdaptiveBuffer {
    pub fn new_read() -> Self {
        Self::with_baseline(BASELINE_READ)
    }

    pub fn new_write() -> Self {
        Self::with_baseline(BASELINE_WRITE)
    }

    fn with_baseline(baseline: usize) -> Self {
        Self {
            current_size: AtomicUsize::new(baseline),
            bytes_since_adjust: AtomicU64::new(0),
            last_adjust: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Record bytes moved and, if the adjustment interval has elapsed,
    /// resize. Returns the (possibly updated) buffer size.
    pub fn record(&self, bytes: usize) -> usize {
        self.bytes_since_adjust.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut last_adjust = self.last_adjust.lock().unwrap();
        let elapsed = last_adjust.elapsed();
        if elapsed < ADJUST_INTERVAL {
            return self.size();
        }

        let moved = self.bytes_since_adjust.swap(0, Ordering::Relaxed);
        let throughput = (moved as f64 / elapsed.as_secs_f64()) as u64;
        *last_adjust = Instant::now();
        drop(last_adjust);

        let current = self.size();
        let next = if throughput > HIGH_THROUGHPUT {
            (current * 2).min(MAX_SIZE)
        } else if throughput > MEDIUM_THROUGHPUT {
            ((current as f64 * 1.5) as usize).min(MAX_SIZE)
        } else if throughput < LOW_THROUGHPUT {
            (current / 2).max(MIN_SIZE)
        } else {
            current
        };

        if next != current {
            tracing::debug!(from = current, to = next, throughput, "adaptive buffer resized");
            self.current_size.store(next, Ordering::Relaxed);
        }
        next
    }
}
