//! Run statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Success/failure counters with accumulated duration, shareable across tasks
#[derive(Debug, Default)]
pub struct OperationMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.add_duration(duration);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.add_duration(duration);
    }

    fn add_duration(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn success_count(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Zero when nothing has been recorded
    pub fn average_duration(&self) -> Duration {
        let count = self.success_count() + self.failure_count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / count)
    }
}

/// Outcome counts of one archive's upload phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    /// Transfers attempted
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub missing: usize,
    pub invalid_routing_key: usize,
    /// Already complete under the same routing key
    pub skipped_complete: usize,
    /// Same file name scheduled again within one pass
    pub duplicates: usize,
    /// Tasks that panicked or were cancelled
    pub aborted: usize,
}

impl UploadSummary {
    pub fn merge(&mut self, other: &UploadSummary) {
        self.attempted += other.attempted;
        self.uploaded += other.uploaded;
        self.failed += other.failed;
        self.missing += other.missing;
        self.invalid_routing_key += other.invalid_routing_key;
        self.skipped_complete += other.skipped_complete;
        self.duplicates += other.duplicates;
        self.aborted += other.aborted;
    }
}

/// Statistics for one sweep
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncStats {
    pub archives_discovered: usize,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub archives_downloaded: usize,
    pub archives_extracted: usize,
    pub archives_completed: usize,
    pub folders_failed: usize,
    pub uploads: UploadSummary,
    /// Mean transfer time in milliseconds
    pub avg_transfer_ms: u64,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn mark_completed(&mut self, transfers: &OperationMetrics) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.avg_transfer_ms = u64::try_from(transfers.average_duration().as_millis()).unwrap_or(u64::MAX);
        if let Some(started) = self.started_at {
            self.duration_secs = (now - started).num_milliseconds() as f64 / 1000.0;
        }
    }
}
