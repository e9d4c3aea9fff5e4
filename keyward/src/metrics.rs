use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::executor::{Outcome, SkipReason};

/// Pipeline counters, owned by one service instance.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Batches read from the stream
    pub batches: AtomicU64,
    /// Raw entries read
    pub hints_consumed: AtomicU64,
    pub malformed: AtomicU64,
    pub duplicates: AtomicU64,
    pub shed_batches: AtomicU64,
    pub successes: AtomicU64,
    /// Retryable outcomes (each one requeued)
    pub retries: AtomicU64,
    pub fatal: AtomicU64,
    pub stale_skips: AtomicU64,
    pub contended_skips: AtomicU64,
    pub cancelled: AtomicU64,
    pub records_published: AtomicU64,
    pub keys_invalidated: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Success { records } => {
                self.records_published
                    .fetch_add(*records as u64, Ordering::Relaxed);
                &self.successes
            },
            Outcome::Retryable { .. } => &self.retries,
            Outcome::Fatal { .. } => &self.fatal,
            Outcome::Skipped(SkipReason::Stale) => &self.stale_skips,
            Outcome::Skipped(SkipReason::Contended) => &self.contended_skips,
            Outcome::Skipped(SkipReason::Cancelled) => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn key_invalidated(&self) {
        self.keys_invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            hints_consumed: self.hints_consumed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            shed_batches: self.shed_batches.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            stale_skips: self.stale_skips.load(Ordering::Relaxed),
            contended_skips: self.contended_skips.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            records_published: self.records_published.load(Ordering::Relaxed),
            keys_invalidated: self.keys_invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`], served at `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub hints_consumed: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub shed_batches: u64,
    pub successes: u64,
    pub retries: u64,
    pub fatal: u64,
    pub stale_skips: u64,
    pub contended_skips: u64,
    pub cancelled: u64,
    pub records_published: u64,
    pub keys_invalidated: u64,
}
