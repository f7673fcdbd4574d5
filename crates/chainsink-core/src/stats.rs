//! Sink statistics — lock-free counters plus a periodic reporter task.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

/// Running counters updated by the sinker.
#[derive(Debug)]
pub struct Stats {
    started: Instant,
    flush_count: AtomicU64,
    rows_flushed: AtomicU64,
    flush_duration_ns: AtomicU64,
    undo_count: AtomicU64,
    blocks_seen: AtomicU64,
    last_block: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub flush_count: u64,
    pub rows_flushed: u64,
    pub flush_duration_ms: u64,
    pub undo_count: u64,
    pub blocks_seen: u64,
    /// Last block written to the store. 0 until the first flush.
    pub last_block: u64,
    pub uptime_secs: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            flush_count: AtomicU64::new(0),
            rows_flushed: AtomicU64::new(0),
            flush_duration_ns: AtomicU64::new(0),
            undo_count: AtomicU64::new(0),
            blocks_seen: AtomicU64::new(0),
            last_block: AtomicU64::new(0),
        }
    }

    pub fn record_flush(&self, rows: usize, took: Duration, block: u64) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.rows_flushed.fetch_add(rows as u64, Ordering::Relaxed);
        self.flush_duration_ns
            .fetch_add(took.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.last_block.store(block, Ordering::Relaxed);
    }

    pub fn record_block(&self) {
        self.blocks_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// An undo resolved without touching the store (undo buffer).
    pub fn record_undo(&self) {
        self.undo_count.fetch_add(1, Ordering::Relaxed);
    }

    /// An undo that reverted the store, moving its cursor to `last_valid_block`.
    pub fn record_revert(&self, last_valid_block: u64) {
        self.undo_count.fetch_add(1, Ordering::Relaxed);
        self.last_block.store(last_valid_block, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flush_count: self.flush_count.load(Ordering::Relaxed),
            rows_flushed: self.rows_flushed.load(Ordering::Relaxed),
            flush_duration_ms: self.flush_duration_ns.load(Ordering::Relaxed) / 1_000_000,
            undo_count: self.undo_count.load(Ordering::Relaxed),
            blocks_seen: self.blocks_seen.load(Ordering::Relaxed),
            last_block: self.last_block.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    /// Emit the current counters as one structured log line.
    pub fn log_now(&self) {
        let s = self.snapshot();
        info!(
            flush_count = s.flush_count,
            rows_flushed = s.rows_flushed,
            flush_duration_ms = s.flush_duration_ms,
            undo_count = s.undo_count,
            blocks_seen = s.blocks_seen,
            last_block = s.last_block,
            "sql sink stats"
        );
    }
}

/// Background task logging [`Stats`] every `interval`. Stops when dropped.
pub struct StatsReporter {
    handle: JoinHandle<()>,
}

impl StatsReporter {
    pub fn spawn(stats: Arc<Stats>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_now();
            }
        });
        Self { handle }
    }

    pub fn close(self) {
        self.handle.abort();
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
