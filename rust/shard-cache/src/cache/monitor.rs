// rust/shard-cache/src/cache/monitor.rs

//! Progress snapshots and the observers notified with them.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::ledger::{CacheLedger, CacheStatus};

/// Point-in-time view of a cache build.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheProgress {
    pub status: CacheStatus,
    /// Committed rows
    pub length: u64,
    pub chunks: u64,
    /// Current interleave round
    pub round: u64,
    pub shards_total: usize,
    pub shards_finished: usize,
    pub updated_at: DateTime<Utc>,
}

impl CacheProgress {
    pub fn from_ledger(ledger: &CacheLedger) -> Self {
        Self {
            status: ledger.status.clone(),
            length: ledger.length,
            chunks: ledger.num_chunks(),
            round: ledger.cursor.round,
            shards_total: ledger.shards.len(),
            shards_finished: ledger.shards.iter().filter(|s| s.finished).count(),
            updated_at: ledger.updated_at,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == CacheStatus::Finished
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Receives a snapshot after every commit and on terminal transitions.
///
/// Called from the commit task, so implementations must not block.
pub trait MetricsMonitor: Send + Sync {
    fn on_progress(&self, progress: &CacheProgress);
}

/// Logs build progress through `tracing`.
pub struct LoggingMonitor {
    name: String,
    started: Instant,
    /// Log at most once per this many commits
    every: u64,
}

impl LoggingMonitor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
            every: 1,
        }
    }

    #[must_use]
    pub fn every(mut self, commits: u64) -> Self {
        self.every = commits.max(1);
        self
    }
}

impl MetricsMonitor for LoggingMonitor {
    fn on_progress(&self, progress: &CacheProgress) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            progress.length as f64 / elapsed
        } else {
            0.0
        };

        match &progress.status {
            CacheStatus::Building => {
                if progress.chunks % self.every == 0 {
                    info!(
                        cache = %self.name,
                        rows = progress.length,
                        chunks = progress.chunks,
                        shards_finished = progress.shards_finished,
                        shards_total = progress.shards_total,
                        rows_per_sec = %format!("{rate:.1}"),
                        "Cache build progress"
                    );
                }
            }
            CacheStatus::Finished => info!(
                cache = %self.name,
                rows = progress.length,
                chunks = progress.chunks,
                elapsed_secs = %format!("{elapsed:.1}"),
                "Cache finished"
            ),
            CacheStatus::Failed { message } => warn!(
                cache = %self.name,
                rows = progress.length,
                error = %message,
                "Cache build failed"
            ),
        }
    }
}

/// Keeps every snapshot in memory.
#[derive(Default)]
pub struct CollectingMonitor {
    seen: Mutex<Vec<CacheProgress>>,
}

impl CollectingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<CacheProgress> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl MetricsMonitor for CollectingMonitor {
    fn on_progress(&self, progress: &CacheProgress) {
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.push(progress.clone());
    }
}
