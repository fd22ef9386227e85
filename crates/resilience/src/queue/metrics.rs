use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

/// Queue metrics for monitoring
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Insertions, counting overwrites.
    pub total_enqueued: AtomicU64,
    /// Attempts that succeeded.
    pub total_succeeded: AtomicU64,
    /// Failed attempts that were rescheduled.
    pub total_rescheduled: AtomicU64,
    /// Entries dropped after exhausting their retries.
    pub total_failed_permanently: AtomicU64,
    /// Caller-initiated removals.
    pub total_removed: AtomicU64,
    /// Attempts across all cycles.
    pub total_attempts: AtomicU64,
    /// Completed processing cycles.
    pub processing_cycles: AtomicU64,
}

impl QueueMetrics {
    /// Create new metrics instance
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an insertion (including overwrites)
    pub fn record_enqueue(&self) {
        self.total_enqueued.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Record a successful attempt
    pub fn record_success(&self) {
        self.total_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Record a failed attempt that was rescheduled
    pub fn record_reschedule(&self) {
        self.total_rescheduled.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Record a transaction dropped after exhausting its retries
    pub fn record_permanent_failure(&self) {
        self.total_failed_permanently.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Record a caller-initiated removal
    pub fn record_removal(&self) {
        self.total_removed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Record one processing cycle that attempted `attempts` entries
    pub fn record_cycle(&self, attempts: u64) {
        self.processing_cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_attempts.fetch_add(attempts, AtomicOrdering::Relaxed);
    }

    /// Get a snapshot of current metrics
    #[must_use]
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            total_enqueued: self.total_enqueued.load(AtomicOrdering::Relaxed),
            total_succeeded: self.total_succeeded.load(AtomicOrdering::Relaxed),
            total_rescheduled: self.total_rescheduled.load(AtomicOrdering::Relaxed),
            total_failed_permanently: self.total_failed_permanently.load(AtomicOrdering::Relaxed),
            total_removed: self.total_removed.load(AtomicOrdering::Relaxed),
            total_attempts: self.total_attempts.load(AtomicOrdering::Relaxed),
            processing_cycles: self.processing_cycles.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Serializable snapshot of queue metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    /// Insertions, counting overwrites.
    pub total_enqueued: u64,
    /// Attempts that succeeded.
    pub total_succeeded: u64,
    /// Failed attempts that were rescheduled.
    pub total_rescheduled: u64,
    /// Entries dropped after exhausting their retries.
    pub total_failed_permanently: u64,
    /// Caller-initiated removals.
    pub total_removed: u64,
    /// Attempts across all cycles.
    pub total_attempts: u64,
    /// Completed processing cycles.
    pub processing_cycles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = QueueMetrics::new();
        metrics.record_enqueue();
        metrics.record_enqueue();
        metrics.record_reschedule();
        metrics.record_permanent_failure();
        metrics.record_cycle(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_enqueued, 2);
        assert_eq!(snapshot.total_rescheduled, 1);
        assert_eq!(snapshot.total_failed_permanently, 1);
        assert_eq!(snapshot.total_attempts, 3);
        assert_eq!(snapshot.processing_cycles, 1);
        assert_eq!(snapshot.total_succeeded, 0);
    }
}
