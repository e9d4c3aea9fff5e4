//! Executes one refresh hint end to end.
//!
//! ```text
//! subject check -> age check -> lease -> upstream call -> publish
//!                                  \__ held until min_spacing has passed __/
//! ```
//!
//! The outcome is handed to `on_outcome` as soon as it is known, before the
//! lease spacing wait, so the ingestion loop can react to errors early.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kwd_client::{ClientError, RecordLog, UpstreamApi, UpstreamRecord};
use kwd_core::{Clock, Hint, HintDeduplicator, SubjectId, redact};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credential::CredentialPool;
use crate::limiter::SubjectLeaseLimiter;
use crate::metrics::PipelineMetrics;
use crate::monitor::KeyHandle;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub provider: String,
    /// Minimum time a lease is held, measured from the start of acquisition.
    pub min_spacing: Duration,
    /// Retryable failures become fatal once a hint has been tried this often.
    pub max_attempts: u32,
    pub upstream_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Records of kind `k` go to topic `{topic_prefix}{k}`.
    pub topic_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            provider: kwd_core::DEFAULT_PROVIDER.to_string(),
            min_spacing: Duration::from_secs(40),
            max_attempts: 3,
            upstream_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
            topic_prefix: "sky-update-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Too old for its source class
    Stale,
    /// Another holder has the subject
    Contended,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { records: usize },
    /// Requeue with `attempt + 1`
    Retryable { reason: String },
    /// Drop the hint
    Fatal { reason: String },
    /// Not executed; never requeued
    Skipped(SkipReason),
}

impl Outcome {
    /// Outcomes that put the ingestion loop into error backoff.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Fatal { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Retryable { .. } => "retryable",
            Self::Fatal { .. } => "fatal",
            Self::Skipped(SkipReason::Stale) => "stale",
            Self::Skipped(SkipReason::Contended) => "contended",
            Self::Skipped(SkipReason::Cancelled) => "cancelled",
        }
    }
}

pub struct UpdateExecutor {
    pool: Arc<CredentialPool>,
    limiter: Arc<SubjectLeaseLimiter>,
    upstream: Arc<dyn UpstreamApi>,
    log: Arc<dyn RecordLog>,
    dedup: HintDeduplicator,
    key_handle: KeyHandle,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl UpdateExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<CredentialPool>,
        limiter: Arc<SubjectLeaseLimiter>,
        upstream: Arc<dyn UpstreamApi>,
        log: Arc<dyn RecordLog>,
        dedup: HintDeduplicator,
        key_handle: KeyHandle,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            limiter,
            upstream,
            log,
            dedup,
            key_handle,
            metrics,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute<F>(
        &self,
        hint: &Hint,
        key: &str,
        cancel: &CancellationToken,
        on_outcome: F,
    ) -> Outcome
    where
        F: FnOnce(&Outcome) + Send,
    {
        let subject = match hint.subject_id() {
            Ok(subject) => subject,
            Err(e) => {
                return self.finish(
                    hint,
                    Outcome::Fatal {
                        reason: e.to_string(),
                    },
                    on_outcome,
                );
            },
        };

        if !self.dedup.admits(hint, self.clock.now()) {
            return self.finish(hint, Outcome::Skipped(SkipReason::Stale), on_outcome);
        }

        let started = Instant::now();
        let lease = match self
            .limiter
            .acquire_cancellable(&subject, self.config.acquire_timeout, cancel)
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                let outcome = self.retry_or_fatal(hint, format!("lease backend: {}", e));
                return self.finish(hint, outcome, on_outcome);
            },
        };
        if !lease.acquired() {
            let reason = if cancel.is_cancelled() {
                SkipReason::Cancelled
            } else {
                SkipReason::Contended
            };
            return self.finish(hint, Outcome::Skipped(reason), on_outcome);
        }

        let outcome = self.refresh(hint, &subject, key, cancel).await;
        let outcome = self.finish(hint, outcome, on_outcome);

        let elapsed = started.elapsed();
        if elapsed < self.config.min_spacing {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.min_spacing - elapsed) => {}
            }
        }
        lease.release().await;
        outcome
    }

    async fn refresh(
        &self,
        hint: &Hint,
        subject: &SubjectId,
        key: &str,
        cancel: &CancellationToken,
    ) -> Outcome {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Outcome::Skipped(SkipReason::Cancelled),
            fetched = tokio::time::timeout(
                self.config.upstream_timeout,
                self.upstream.fetch_subject(subject, key),
            ) => fetched,
        };

        // A rejected key is about to be invalidated; recording the use would
        // move this replica's affinity onto it.
        let rejected = matches!(&fetched, Ok(Err(e)) if e.is_auth_failure());
        if !rejected {
            if let Err(e) = self.pool.used_key(&self.config.provider, key, 1).await {
                warn!(target: "keyward::executor", error = %e, "Recording key use failed");
            }
        }

        match fetched {
            Ok(Ok(records)) => match self.publish(subject, &records).await {
                Ok(()) => Outcome::Success {
                    records: records.len(),
                },
                Err(e) => self.retry_or_fatal(hint, format!("publish failed: {}", e)),
            },
            Ok(Err(e)) if e.is_auth_failure() => {
                warn!(
                    target: "keyward::executor",
                    subject = %subject,
                    key = %redact(key),
                    "Upstream rejected key"
                );
                match self.pool.invalidate_key(&self.config.provider, key).await {
                    Ok(changed) if changed > 0 => self.metrics.key_invalidated(),
                    Ok(_) => {},
                    Err(e) => {
                        warn!(target: "keyward::executor", error = %e, "Invalidation failed");
                    },
                }
                self.key_handle.report_invalid(key);
                self.retry_or_fatal(hint, e.to_string())
            },
            Ok(Err(e)) => self.retry_or_fatal(hint, e.to_string()),
            Err(_) => self.retry_or_fatal(hint, ClientError::Timeout.to_string()),
        }
    }

    async fn publish(&self, subject: &SubjectId, records: &[UpstreamRecord]) -> kwd_client::Result<()> {
        for record in records {
            let topic = format!("{}{}", self.config.topic_prefix, record.kind);
            let payload = serde_json::to_vec(&record.payload)
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            self.log
                .publish(&topic, subject.as_str(), Bytes::from(payload))
                .await?;
        }
        Ok(())
    }

    fn retry_or_fatal(&self, hint: &Hint, reason: String) -> Outcome {
        if hint.attempt < self.config.max_attempts {
            Outcome::Retryable { reason }
        } else {
            Outcome::Fatal {
                reason: format!("giving up after {} attempts: {}", hint.attempt + 1, reason),
            }
        }
    }

    fn finish<F>(&self, hint: &Hint, outcome: Outcome, on_outcome: F) -> Outcome
    where
        F: FnOnce(&Outcome),
    {
        match &outcome {
            Outcome::Success { records } => {
                debug!(
                    target: "keyward::executor",
                    subject = %hint.subject,
                    source = %hint.source,
                    records,
                    "Subject refreshed"
                );
            },
            Outcome::Retryable { reason } | Outcome::Fatal { reason } => {
                info!(
                    target: "keyward::executor",
                    subject = %hint.subject,
                    attempt = hint.attempt,
                    outcome = outcome.label(),
                    reason = %reason,
                    "Refresh failed"
                );
            },
            Outcome::Skipped(_) => {
                debug!(
                    target: "keyward::executor",
                    subject = %hint.subject,
                    outcome = outcome.label(),
                    "Refresh skipped"
                );
            },
        }
        self.metrics.record_outcome(&outcome);
        on_outcome(&outcome);
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::TimerClock;
    use crate::credential::PoolConfig;
    use crate::limiter::LimiterConfig;
    use chrono::Utc;
    use kwd_client::{
        MemoryKeyStore, MemoryLeaseBackend, MemoryRecordLog, Scripted, ScriptedUpstream,
        StaticIdentity,
    };
    use serde_json::json;
    use std::sync::Mutex;

    const SUBJECT: &str = "a2080281c2784181b961d99ed2f3347c";
    const KEY: &str = "0123456789abcdef";

    struct Fixture {
        executor: Arc<UpdateExecutor>,
        pool: Arc<CredentialPool>,
        upstream: ScriptedUpstream,
        log: MemoryRecordLog,
        leases: MemoryLeaseBackend,
        handle: KeyHandle,
        clock: TimerClock,
    }

    async fn fixture() -> Fixture {
        let pool = Arc::new(CredentialPool::new(
            Arc::new(MemoryKeyStore::new()),
            Arc::new(StaticIdentity::new("10.0.0.1")),
            PoolConfig::default(),
        ));
        pool.enroll("hypixel", KEY, "ops").await.unwrap();
        let leases = MemoryLeaseBackend::new();
        let limiter = Arc::new(SubjectLeaseLimiter::new(
            Arc::new(leases.clone()),
            LimiterConfig::default(),
        ));
        let upstream = ScriptedUpstream::new();
        let log = MemoryRecordLog::new();
        let handle = KeyHandle::new();
        handle.publish(KEY.to_string());
        let clock = TimerClock::new();
        let executor = Arc::new(UpdateExecutor::new(
            Arc::clone(&pool),
            limiter,
            Arc::new(upstream.clone()),
            Arc::new(log.clone()),
            HintDeduplicator::default(),
            handle.clone(),
            Arc::new(PipelineMetrics::new()),
            Arc::new(clock),
            ExecutorConfig::default(),
        ));
        Fixture {
            executor,
            pool,
            upstream,
            log,
            leases,
            handle,
            clock,
        }
    }

    fn fresh(subject: &str) -> Hint {
        Hint::new(subject, "ah", Utc::now())
    }

    fn record(kind: &str) -> UpstreamRecord {
        UpstreamRecord {
            kind: kind.into(),
            subject: SUBJECT.into(),
            payload: json!({"uuid": "x"}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_publishes_and_holds_spacing() {
        let f = fixture().await;
        f.upstream
            .push(Scripted::Records(vec![record("auction"), record("auction")]));

        let started = Instant::now();
        let outcome = f
            .executor
            .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), |_| {})
            .await;

        assert_eq!(outcome, Outcome::Success { records: 2 });
        let published = f.log.topic("sky-update-auction");
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].key, SUBJECT);
        assert!(started.elapsed() >= Duration::from_secs(40));
        assert_eq!(f.leases.live_counters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_signalled_before_spacing() {
        let f = fixture().await;
        let seen_at = Arc::new(Mutex::new(None));
        let started = Instant::now();

        let seen = Arc::clone(&seen_at);
        f.executor
            .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), move |o| {
                *seen.lock().unwrap() = Some((o.clone(), Instant::now()));
            })
            .await;

        let (outcome, at) = seen_at.lock().unwrap().clone().unwrap();
        assert_eq!(outcome, Outcome::Success { records: 0 });
        assert!(at.duration_since(started) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_malformed_subject_is_fatal_without_lease_or_call() {
        let f = fixture().await;
        let outcome = f
            .executor
            .execute(&fresh("not-a-subject"), KEY, &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(outcome, Outcome::Fatal { .. }));
        assert!(f.upstream.fetch_calls().is_empty());
        assert_eq!(f.leases.live_counters(), 0);
    }

    #[tokio::test]
    async fn test_stale_hint_skipped() {
        let f = fixture().await;
        let hint = Hint::new(SUBJECT, "recheck", Utc::now() - chrono::Duration::seconds(7));
        let outcome = f
            .executor
            .execute(&hint, KEY, &CancellationToken::new(), |_| {})
            .await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::Stale));
        assert!(f.upstream.fetch_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_subject_is_contended() {
        let f = fixture().await;
        let first = {
            let executor = Arc::clone(&f.executor);
            tokio::spawn(async move {
                executor
                    .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), |_| {})
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = f
            .executor
            .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), |_| {})
            .await;
        assert_eq!(second, Outcome::Skipped(SkipReason::Contended));
        assert_eq!(first.await.unwrap(), Outcome::Success { records: 0 });
        assert_eq!(f.upstream.fetch_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_invalidates_and_reports() {
        let f = fixture().await;
        f.upstream.push(Scripted::Forbidden);

        let outcome = f
            .executor
            .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), |_| {})
            .await;

        assert!(matches!(outcome, Outcome::Retryable { .. }));
        assert_eq!(f.pool.active_key_count("hypixel").await.unwrap(), 0);
        assert!(f.handle.current().is_none());

        // The rejected call is not recorded as a use of the dead key
        let row = &f.pool.keys("hypixel").await.unwrap()[0];
        assert_eq!(row.use_count, 0);
        assert!(row.last_server_affinity.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_call_records_use_and_affinity() {
        let f = fixture().await;
        f.executor
            .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), |_| {})
            .await;

        let row = &f.pool.keys("hypixel").await.unwrap()[0];
        assert_eq!(row.use_count, 1);
        assert_eq!(row.last_server_affinity.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let f = fixture().await;
        for _ in 0..4 {
            f.upstream.push(Scripted::Status(502));
        }

        let mut hint = Hint::new(SUBJECT, "ah", f.clock.now());
        for attempt in 0..3 {
            let outcome = f
                .executor
                .execute(&hint, KEY, &CancellationToken::new(), |_| {})
                .await;
            assert!(
                matches!(outcome, Outcome::Retryable { .. }),
                "attempt {attempt} should be retryable"
            );
            hint = hint.retry(f.clock.now());
        }
        assert_eq!(hint.attempt, 3);
        let outcome = f
            .executor
            .execute(&hint, KEY, &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(outcome, Outcome::Fatal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reaches_upstream_after_spacing_ages_first_sighting() {
        let f = fixture().await;
        f.upstream.push(Scripted::Status(502));
        f.upstream.push(Scripted::Status(502));

        let hint = Hint::new(SUBJECT, "ah", f.clock.now());
        let first = f
            .executor
            .execute(&hint, KEY, &CancellationToken::new(), |_| {})
            .await;
        assert_eq!(first.label(), "retryable");

        // The lease spacing has pushed the first sighting past every age limit
        let now = f.clock.now();
        assert!(hint.age(now) >= Duration::from_secs(40));
        assert!(!HintDeduplicator::default().admits(&hint, now));

        let retry = hint.retry(now);
        let second = f
            .executor
            .execute(&retry, KEY, &CancellationToken::new(), |_| {})
            .await;
        assert_eq!(second.label(), "retryable");
        assert_eq!(f.upstream.fetch_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_timeout_is_retryable() {
        let f = fixture().await;
        f.upstream.set_fetch_delay(Duration::from_secs(30));
        let outcome = f
            .executor
            .execute(&fresh(SUBJECT), KEY, &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(outcome, Outcome::Retryable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cuts_spacing_and_releases() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let task = {
            let executor = Arc::clone(&f.executor);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .execute(&fresh(SUBJECT), KEY, &cancel, |_| {})
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        let started = Instant::now();
        cancel.cancel();

        assert_eq!(task.await.unwrap(), Outcome::Success { records: 0 });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.leases.live_counters(), 0);
    }

    #[test]
    fn test_outcome_labels() {
        assert!(Outcome::Fatal { reason: "x".into() }.is_error());
        assert!(Outcome::Retryable { reason: "x".into() }.is_error());
        assert!(!Outcome::Skipped(SkipReason::Contended).is_error());
        assert_eq!(Outcome::Skipped(SkipReason::Stale).label(), "stale");
    }
}
