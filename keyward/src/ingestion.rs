//! Stream consumer driving the refresh pipeline.
//!
//! ```text
//! AwaitingKey -> Polling -> BatchReady -> Dispatching -> Polling
//!                   ^                          |
//!                   +------ BackoffOnError <---+  (an error outcome was reported)
//! ```
//!
//! Entries are acknowledged as soon as the batch has been deduplicated. Failed
//! hints come back through the stream as new entries with a higher attempt
//! count, stamped when they are requeued; there is no redelivery.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use kwd_client::{ClientError, HintStream, enqueue_hint};
use kwd_core::{Clock, Hint, HintDeduplicator, JitterBackoff, PollBackoff, RawEntry};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::executor::{Outcome, UpdateExecutor};
use crate::metrics::PipelineMetrics;
use crate::monitor::{KeyHandle, sleep_or_cancel};

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    /// How long one read blocks waiting for entries.
    pub read_timeout: Duration,
    pub poll_backoff_step: Duration,
    pub poll_backoff_max: Duration,
    /// Longest the loop waits on one batch before detaching stragglers.
    pub batch_ceiling: Duration,
    pub error_backoff_min: Duration,
    pub error_backoff_max: Duration,
    /// Pause after an unexpected stream error.
    pub restart_delay: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            stream: "ah-update".to_string(),
            group: "keyward-ah-update".to_string(),
            consumer: "keyward".to_string(),
            batch_size: 4,
            read_timeout: Duration::from_secs(2),
            poll_backoff_step: Duration::from_millis(500),
            poll_backoff_max: Duration::from_secs(10),
            batch_ceiling: Duration::from_secs(60),
            error_backoff_min: Duration::from_secs(5),
            error_backoff_max: Duration::from_secs(15),
            restart_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
enum LoopState {
    AwaitingKey,
    Polling,
    BatchReady(Vec<RawEntry>),
    Dispatching(Vec<Hint>),
    BackoffOnError,
    Stopped,
}

impl LoopState {
    fn name(&self) -> &'static str {
        match self {
            Self::AwaitingKey => "awaiting_key",
            Self::Polling => "polling",
            Self::BatchReady(_) => "batch_ready",
            Self::Dispatching(_) => "dispatching",
            Self::BackoffOnError => "backoff_on_error",
            Self::Stopped => "stopped",
        }
    }
}

type HintTaskResult = (String, Outcome);

pub struct IngestionLoop {
    stream: Arc<dyn HintStream>,
    executor: Arc<UpdateExecutor>,
    dedup: HintDeduplicator,
    key_handle: KeyHandle,
    metrics: Arc<PipelineMetrics>,
    tracker: TaskTracker,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
}

impl IngestionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: Arc<dyn HintStream>,
        executor: Arc<UpdateExecutor>,
        dedup: HintDeduplicator,
        key_handle: KeyHandle,
        metrics: Arc<PipelineMetrics>,
        tracker: TaskTracker,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            stream,
            executor,
            dedup,
            key_handle,
            metrics,
            tracker,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Consume the stream until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Outcome>();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<Hint>();
        let mut poll_backoff =
            PollBackoff::new(self.config.poll_backoff_step, self.config.poll_backoff_max);
        let error_backoff =
            JitterBackoff::new(self.config.error_backoff_min, self.config.error_backoff_max);

        info!(
            target: "keyward::ingestion",
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "Ingestion loop starting"
        );
        self.ensure_group().await;

        let mut state = LoopState::AwaitingKey;
        loop {
            if cancel.is_cancelled() {
                state = LoopState::Stopped;
            }
            trace!(target: "keyward::ingestion", state = state.name(), "Loop step");

            state = match state {
                LoopState::AwaitingKey => match self.key_handle.wait_for_key(&cancel).await {
                    Some(_) => LoopState::Polling,
                    None => LoopState::Stopped,
                },
                LoopState::Polling => {
                    self.republish_retries(&mut retry_rx).await;
                    self.poll(&cancel, &mut poll_backoff).await
                },
                LoopState::BatchReady(entries) => {
                    let hints = self.prepare_batch(&entries).await;
                    if hints.is_empty() {
                        self.after_batch(&mut report_rx)
                    } else {
                        LoopState::Dispatching(hints)
                    }
                },
                LoopState::Dispatching(hints) => {
                    self.dispatch(hints, &report_tx, &retry_tx, &cancel).await;
                    self.after_batch(&mut report_rx)
                },
                LoopState::BackoffOnError => {
                    let delay = error_backoff.next_delay();
                    info!(
                        target: "keyward::ingestion",
                        delay_ms = delay.as_millis() as u64,
                        "Backing off after failed refreshes"
                    );
                    if sleep_or_cancel(delay, &cancel).await {
                        LoopState::Polling
                    } else {
                        LoopState::Stopped
                    }
                },
                LoopState::Stopped => break,
            };
        }

        // Stragglers finishing after this requeue on their own.
        retry_rx.close();
        self.republish_retries(&mut retry_rx).await;

        info!(target: "keyward::ingestion", "Ingestion loop stopped");
    }

    async fn ensure_group(&self) {
        match self
            .stream
            .create_group(&self.config.stream, &self.config.group)
            .await
        {
            Ok(()) => {
                info!(
                    target: "keyward::ingestion",
                    stream = %self.config.stream,
                    group = %self.config.group,
                    "Created consumer group"
                );
            },
            Err(ClientError::GroupExists { .. }) => {},
            Err(e) => {
                error!(target: "keyward::ingestion", error = %e, "Consumer group creation failed");
            },
        }
    }

    async fn poll(&self, cancel: &CancellationToken, backoff: &mut PollBackoff) -> LoopState {
        if self.key_handle.current().is_none() {
            return LoopState::AwaitingKey;
        }

        let read = self.stream.read_group(
            &self.config.stream,
            &self.config.group,
            &self.config.consumer,
            self.config.batch_size,
            self.config.read_timeout,
        );
        let result = tokio::select! {
            _ = cancel.cancelled() => return LoopState::Stopped,
            result = read => result,
        };

        match result {
            Ok(entries) if entries.is_empty() => {
                let delay = backoff.on_empty();
                trace!(
                    target: "keyward::ingestion",
                    empty_polls = backoff.empty_polls(),
                    delay_ms = delay.as_millis() as u64,
                    "No entries"
                );
                if sleep_or_cancel(delay, cancel).await {
                    LoopState::Polling
                } else {
                    LoopState::Stopped
                }
            },
            Ok(entries) => {
                backoff.reset();
                LoopState::BatchReady(entries)
            },
            Err(ClientError::GroupMissing { stream, group }) => {
                warn!(
                    target: "keyward::ingestion",
                    stream = %stream,
                    group = %group,
                    "Consumer group missing, recreating"
                );
                self.ensure_group().await;
                LoopState::Polling
            },
            Err(e) => {
                error!(target: "keyward::ingestion", error = %e, "Stream read failed");
                if sleep_or_cancel(self.config.restart_delay, cancel).await {
                    LoopState::Polling
                } else {
                    LoopState::Stopped
                }
            },
        }
    }

    /// Deduplicate and acknowledge one batch; returns the hints to run.
    async fn prepare_batch(&self, entries: &[RawEntry]) -> Vec<Hint> {
        self.metrics.batches.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .hints_consumed
            .fetch_add(entries.len() as u64, Ordering::Relaxed);

        let outcome = self.dedup.dedup(entries, self.clock.now());
        self.metrics
            .malformed
            .fetch_add(outcome.malformed as u64, Ordering::Relaxed);
        self.metrics
            .duplicates
            .fetch_add(outcome.duplicates as u64, Ordering::Relaxed);
        if outcome.is_shed() {
            self.metrics.shed_batches.fetch_add(1, Ordering::Relaxed);
        }

        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        match self
            .stream
            .ack(&self.config.stream, &self.config.group, &ids)
            .await
        {
            Ok(acked) => {
                debug!(target: "keyward::ingestion", entries = ids.len(), acked, "Batch acknowledged");
            },
            Err(e) => {
                warn!(target: "keyward::ingestion", error = %e, "Ack failed");
            },
        }

        outcome.hints().to_vec()
    }

    async fn dispatch(
        &self,
        hints: Vec<Hint>,
        reports: &mpsc::UnboundedSender<Outcome>,
        retries: &mpsc::UnboundedSender<Hint>,
        cancel: &CancellationToken,
    ) {
        let Some(key) = self.key_handle.wait_for_key(cancel).await else {
            return;
        };

        let mut tasks: JoinSet<HintTaskResult> = JoinSet::new();
        for hint in hints {
            let executor = Arc::clone(&self.executor);
            let stream = Arc::clone(&self.stream);
            let clock = Arc::clone(&self.clock);
            let stream_name = self.config.stream.clone();
            let reports = reports.clone();
            let retries = retries.clone();
            let cancel = cancel.clone();
            let key = key.clone();
            tasks.spawn(self.tracker.track_future(async move {
                let outcome = executor
                    .execute(&hint, &key, &cancel, move |outcome| {
                        let _ = reports.send(outcome.clone());
                    })
                    .await;
                if matches!(outcome, Outcome::Retryable { .. }) {
                    if let Err(mpsc::error::SendError(hint)) = retries.send(hint.clone()) {
                        requeue(stream.as_ref(), &stream_name, &hint.retry(clock.now())).await;
                    }
                }
                (hint.subject, outcome)
            }));
        }

        let ceiling = tokio::time::sleep(self.config.batch_ceiling);
        tokio::pin!(ceiling);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(result) => log_task_result(result),
                    None => return,
                },
                _ = &mut ceiling => {
                    warn!(
                        target: "keyward::ingestion",
                        stragglers = tasks.len(),
                        "Batch ceiling reached, moving on"
                    );
                    break;
                }
                _ = cancel.cancelled() => break,
            }
        }

        if !tasks.is_empty() {
            self.tracker.spawn(drain_stragglers(tasks));
        }
    }

    /// Requeue hints whose refresh failed retryably, one attempt later.
    ///
    /// Runs right before each poll, so a retry is stamped after the error
    /// backoff that its own failure triggered and is still fresh when read.
    async fn republish_retries(&self, retries: &mut mpsc::UnboundedReceiver<Hint>) {
        while let Ok(hint) = retries.try_recv() {
            let retry = hint.retry(self.clock.now());
            requeue(self.stream.as_ref(), &self.config.stream, &retry).await;
        }
    }

    fn after_batch(&self, reports: &mut mpsc::UnboundedReceiver<Outcome>) -> LoopState {
        if Self::errors_reported(reports) {
            LoopState::BackoffOnError
        } else {
            LoopState::Polling
        }
    }

    /// Drain pending reports; true if any of them was an error.
    fn errors_reported(reports: &mut mpsc::UnboundedReceiver<Outcome>) -> bool {
        let mut errored = false;
        while let Ok(outcome) = reports.try_recv() {
            errored |= outcome.is_error();
        }
        errored
    }
}

async fn requeue(stream: &dyn HintStream, stream_name: &str, retry: &Hint) {
    match enqueue_hint(stream, stream_name, retry).await {
        Ok(id) => {
            debug!(
                target: "keyward::ingestion",
                subject = %retry.subject,
                attempt = retry.attempt,
                entry_id = %id,
                "Hint requeued"
            );
        },
        Err(e) => {
            error!(
                target: "keyward::ingestion",
                subject = %retry.subject,
                error = %e,
                "Requeue failed, hint lost"
            );
        },
    }
}

async fn drain_stragglers(mut tasks: JoinSet<HintTaskResult>) {
    while let Some(result) = tasks.join_next().await {
        log_task_result(result);
    }
}

fn log_task_result(result: Result<HintTaskResult, JoinError>) {
    match result {
        Ok((subject, outcome)) => {
            trace!(
                target: "keyward::ingestion",
                subject = %subject,
                outcome = outcome.label(),
                "Hint task finished"
            );
        },
        Err(e) => {
            error!(target: "keyward::ingestion", error = %e, "Hint task failed");
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::TimerClock;
    use crate::credential::{CredentialPool, PoolConfig};
    use crate::executor::ExecutorConfig;
    use crate::limiter::{LimiterConfig, SubjectLeaseLimiter};
    use kwd_client::{
        MemoryHintStream, MemoryKeyStore, MemoryLeaseBackend, MemoryRecordLog, Scripted,
        ScriptedUpstream, StaticIdentity, UpstreamRecord,
    };
    use serde_json::json;

    const SUBJECT_A: &str = "a2080281c2784181b961d99ed2f3347c";
    const SUBJECT_B: &str = "f7c77d999f154a66a87dc4a51ef30d19";
    const KEY: &str = "0123456789abcdef";

    struct Harness {
        ingestion: Arc<IngestionLoop>,
        stream: MemoryHintStream,
        upstream: ScriptedUpstream,
        log: MemoryRecordLog,
        metrics: Arc<PipelineMetrics>,
        handle: KeyHandle,
        clock: TimerClock,
        config: IngestionConfig,
    }

    async fn harness() -> Harness {
        let pool = Arc::new(CredentialPool::new(
            Arc::new(MemoryKeyStore::new()),
            Arc::new(StaticIdentity::new("10.0.0.1")),
            PoolConfig::default(),
        ));
        pool.enroll("hypixel", KEY, "ops").await.unwrap();
        let stream = MemoryHintStream::new();
        let upstream = ScriptedUpstream::new();
        let log = MemoryRecordLog::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let handle = KeyHandle::new();
        let clock = TimerClock::new();
        let executor = Arc::new(UpdateExecutor::new(
            pool,
            Arc::new(SubjectLeaseLimiter::new(
                Arc::new(MemoryLeaseBackend::new()),
                LimiterConfig::default(),
            )),
            Arc::new(upstream.clone()),
            Arc::new(log.clone()),
            HintDeduplicator::default(),
            handle.clone(),
            Arc::clone(&metrics),
            Arc::new(clock),
            ExecutorConfig::default(),
        ));
        let config = IngestionConfig::default();
        let ingestion = Arc::new(IngestionLoop::new(
            Arc::new(stream.clone()),
            executor,
            HintDeduplicator::default(),
            handle.clone(),
            Arc::clone(&metrics),
            TaskTracker::new(),
            Arc::new(clock),
            config.clone(),
        ));
        Harness {
            ingestion,
            stream,
            upstream,
            log,
            metrics,
            handle,
            clock,
            config,
        }
    }

    fn spawn(h: &Harness, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let ingestion = Arc::clone(&h.ingestion);
        let cancel = cancel.clone();
        tokio::spawn(async move { ingestion.run(cancel).await })
    }

    async fn add(h: &Harness, hint: &Hint) {
        enqueue_hint(&h.stream, &h.config.stream, hint).await.unwrap();
    }

    async fn add_raw(h: &Harness, payload: &str) {
        h.stream
            .add(&h.config.stream, RawEntry::with_payload("", payload).fields)
            .await
            .unwrap();
    }

    fn fresh(h: &Harness, subject: &str) -> Hint {
        Hint::new(subject, "ah", h.clock.now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_starts_at_tail() {
        let h = harness().await;
        add(&h, &fresh(&h, SUBJECT_A)).await;
        h.handle.publish(KEY.to_string());

        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.upstream.fetch_calls().is_empty());
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_key_before_polling() {
        let h = harness().await;
        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;

        add(&h, &fresh(&h, SUBJECT_A)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.stream.pending(&h.config.stream, &h.config.group), 0);
        assert!(h.upstream.fetch_calls().is_empty());

        h.handle.publish(KEY.to_string());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.upstream.fetch_calls().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_deduplicated_executed_and_acked() {
        let h = harness().await;
        h.handle.publish(KEY.to_string());
        h.upstream.push(Scripted::Records(vec![UpstreamRecord {
            kind: "auction".into(),
            subject: SUBJECT_A.into(),
            payload: json!({"bid": 10}),
        }]));

        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let now = h.clock.now();
        add(&h, &Hint::new(SUBJECT_A, "ah", now)).await;
        add(&h, &Hint::new(SUBJECT_A, "ah", now - chrono::Duration::seconds(1))).await;
        add(&h, &Hint::new(SUBJECT_B, "ah", now)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let fetches = h.upstream.fetches_by_subject();
        assert_eq!(fetches.get(SUBJECT_A), Some(&1));
        assert_eq!(fetches.get(SUBJECT_B), Some(&1));
        assert_eq!(h.stream.pending(&h.config.stream, &h.config.group), 0);
        assert_eq!(h.log.topic("sky-update-auction").len(), 1);

        let snap = h.metrics.snapshot();
        assert_eq!(snap.hints_consumed, 3);
        assert_eq!(snap.duplicates, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_entries_acked_not_executed() {
        let h = harness().await;
        h.handle.publish(KEY.to_string());
        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;

        add_raw(&h, "{not json").await;
        add(&h, &fresh(&h, SUBJECT_A)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.upstream.fetch_calls().len(), 1);
        assert_eq!(h.metrics.snapshot().malformed, 1);
        assert_eq!(h.stream.pending(&h.config.stream, &h.config.group), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_outcome_requeues_with_next_attempt() {
        let h = harness().await;
        h.handle.publish(KEY.to_string());
        h.upstream.push(Scripted::Status(503));
        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let first = fresh(&h, SUBJECT_A);
        add(&h, &first).await;
        // Past the lease spacing and the first error backoff
        tokio::time::sleep(Duration::from_secs(60)).await;

        let entries = h.stream.entries(&h.config.stream);
        assert_eq!(entries.len(), 2);
        let requeued = entries[1].parse_hint().unwrap();
        assert_eq!(requeued.subject, SUBJECT_A);
        assert_eq!(requeued.attempt, 1);
        // Stamped after the spacing wait and the error backoff
        let waited = requeued.provided_at - first.provided_at;
        assert!(waited >= chrono::Duration::seconds(45));
        // ...so the retry was fresh when read and reached upstream again
        assert_eq!(h.upstream.fetch_calls().len(), 2);
        assert_eq!(h.metrics.snapshot().retries, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_group_is_recreated() {
        let h = harness().await;
        h.handle.publish(KEY.to_string());
        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(h.stream.drop_group(&h.config.stream, &h.config.group));
        tokio::time::sleep(Duration::from_secs(15)).await;

        add(&h, &fresh(&h, SUBJECT_A)).await;
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(h.upstream.fetch_calls().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop_mid_batch() {
        let h = harness().await;
        h.handle.publish(KEY.to_string());
        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;

        add(&h, &fresh(&h, SUBJECT_A)).await;
        // The hint task now holds its lease through the spacing wait
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.upstream.fetch_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_left_at_shutdown_are_still_requeued() {
        let h = harness().await;
        h.handle.publish(KEY.to_string());
        h.upstream.push(Scripted::Status(503));
        let cancel = CancellationToken::new();
        let task = spawn(&h, &cancel);
        tokio::time::sleep(Duration::from_secs(1)).await;

        add(&h, &fresh(&h, SUBJECT_A)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Cancelling cuts the spacing wait; the retry is handed back as the loop stops
        cancel.cancel();
        task.await.unwrap();
        h.ingestion.tracker.close();
        h.ingestion.tracker.wait().await;

        let entries = h.stream.entries(&h.config.stream);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].parse_hint().unwrap().attempt, 1);
    }

    #[test]
    fn test_errors_reported_drains_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(Outcome::Success { records: 1 }).unwrap();
        tx.send(Outcome::Fatal {
            reason: "bad".into(),
        })
        .unwrap();
        assert!(IngestionLoop::errors_reported(&mut rx));
        assert!(!IngestionLoop::errors_reported(&mut rx));
    }
}
