//! Batch deduplication and staleness policy.
//!
//! Turns one raw batch into the set of hints worth dispatching:
//!
//! 1. entries that do not parse are dropped (malformed input is never retried)
//! 2. if more than `batch_stale_limit` hints are older than `batch_stale_after`
//!    the whole batch is shed; the pipeline is too far behind for any of it
//!    to be useful
//! 3. one hint per subject survives, the one with the earliest `provided_at`
//!
//! Per-hint age limits are checked later, by the executor, via
//! [`HintDeduplicator::admits`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::hint::{Hint, RawEntry};

/// Age thresholds for batch shedding and per-hint expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Age after which a hint counts towards the batch shedding limit.
    pub batch_stale_after: Duration,
    /// Shed the batch when strictly more stale hints than this are present.
    pub batch_stale_limit: usize,
    /// Per-hint expiry for ordinary sources.
    pub hint_max_age: Duration,
    /// Per-hint expiry for low-priority sources.
    pub low_priority_max_age: Duration,
    /// Source prefixes (case-insensitive) treated as low priority.
    pub low_priority_sources: Vec<String>,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            batch_stale_after: Duration::from_secs(9),
            batch_stale_limit: 2,
            hint_max_age: Duration::from_secs(9),
            low_priority_max_age: Duration::from_secs(6),
            low_priority_sources: vec!["recheck".to_string()],
        }
    }
}

impl StalenessPolicy {
    #[must_use]
    pub fn is_low_priority(&self, source: &str) -> bool {
        let source = source.to_ascii_lowercase();
        self.low_priority_sources
            .iter()
            .any(|prefix| source.starts_with(&prefix.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn max_age_for(&self, source: &str) -> Duration {
        if self.is_low_priority(source) {
            self.low_priority_max_age
        } else {
            self.hint_max_age
        }
    }
}

/// What to do with a deduplicated batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    /// Freshest-intent hint per subject, in order of first appearance.
    Dispatch(Vec<Hint>),
    /// Too many stale hints; nothing from this batch is executed.
    Shed { stale: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    pub decision: BatchDecision,
    pub malformed: usize,
    pub duplicates: usize,
}

impl DedupOutcome {
    /// Hints to dispatch; empty when the batch was shed.
    #[must_use]
    pub fn hints(&self) -> &[Hint] {
        match &self.decision {
            BatchDecision::Dispatch(hints) => hints,
            BatchDecision::Shed { .. } => &[],
        }
    }

    #[must_use]
    pub fn is_shed(&self) -> bool {
        matches!(self.decision, BatchDecision::Shed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HintDeduplicator {
    policy: StalenessPolicy,
}

impl HintDeduplicator {
    #[must_use]
    pub fn new(policy: StalenessPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    pub fn dedup(&self, entries: &[RawEntry], now: DateTime<Utc>) -> DedupOutcome {
        let mut parsed = Vec::with_capacity(entries.len());
        let mut malformed = 0;

        for entry in entries {
            match entry.parse_hint() {
                Ok(hint) => parsed.push(hint),
                Err(e) => {
                    malformed += 1;
                    warn!(
                        target: "keyward::dedup",
                        entry_id = %entry.id,
                        error = %e,
                        "Dropping malformed stream entry"
                    );
                },
            }
        }

        let stale = parsed
            .iter()
            .filter(|hint| hint.age(now) > self.policy.batch_stale_after)
            .count();
        if stale > self.policy.batch_stale_limit {
            warn!(
                target: "keyward::dedup",
                stale,
                batch = entries.len(),
                "Shedding batch, consumer is behind"
            );
            return DedupOutcome {
                decision: BatchDecision::Shed { stale },
                malformed,
                duplicates: 0,
            };
        }

        let mut order: Vec<Hint> = Vec::with_capacity(parsed.len());
        let mut slot_by_subject: HashMap<String, usize> = HashMap::with_capacity(parsed.len());
        let mut duplicates = 0;

        for hint in parsed {
            match slot_by_subject.get(&hint.subject) {
                Some(&slot) => {
                    duplicates += 1;
                    if hint.provided_at < order[slot].provided_at {
                        order[slot] = hint;
                    }
                },
                None => {
                    slot_by_subject.insert(hint.subject.clone(), order.len());
                    order.push(hint);
                },
            }
        }

        if duplicates > 0 {
            debug!(
                target: "keyward::dedup",
                duplicates,
                kept = order.len(),
                "Collapsed duplicate hints"
            );
        }

        DedupOutcome {
            decision: BatchDecision::Dispatch(order),
            malformed,
            duplicates,
        }
    }

    /// Fine-grained expiry: is `hint` still young enough for its source class?
    #[must_use]
    pub fn admits(&self, hint: &Hint, now: DateTime<Utc>) -> bool {
        hint.age(now) <= self.policy.max_age_for(&hint.source)
    }
}
