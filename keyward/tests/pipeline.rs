//! End-to-end behaviour of one or more replicas over the in-process backends.
//!
//! Replicas read wall-clock time through a [`TimerClock`], so hint ages move
//! with the paused tokio clock the same way spacing waits and backoffs do.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use hyper::{Method, StatusCode};
use keyward::{
    Backends, Config, CredentialPool, LimiterConfig, PoolConfig, Service, SubjectLeaseLimiter,
    TimerClock,
};
use kwd_client::{
    HintStream, KeyStore, MemoryHintStream, MemoryKeyStore, MemoryLeaseBackend, MemoryRecordLog,
    Scripted, ScriptedUpstream, StaticIdentity, UpstreamRecord, enqueue_hint,
};
use kwd_core::{ApiKey, Clock, Hint, HintDeduplicator, KeywardError, RawEntry, SubjectId};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STREAM: &str = "ah-update";
const GROUP: &str = "keyward-ah-update";
const SUBJECT_A: &str = "a2080281c2784181b961d99ed2f3347c";
const SUBJECT_B: &str = "f7c77d999f154a66a87dc4a51ef30d19";
const SUBJECT_C: &str = "0c1d2e3f405162738495a6b7c8d9eaf0";
const KEY_A: &str = "aaaaaaaaaa-key-one";
const KEY_B: &str = "bbbbbbbbbb-key-two";

struct Replica {
    service: Arc<Service>,
    stream: MemoryHintStream,
    upstream: ScriptedUpstream,
    log: MemoryRecordLog,
    keys: MemoryKeyStore,
    clock: TimerClock,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Replica {
    async fn start(keys: &[&str]) -> Self {
        let stream = MemoryHintStream::new();
        let upstream = ScriptedUpstream::new();
        let log = MemoryRecordLog::new();
        let store = MemoryKeyStore::new();
        let clock = TimerClock::new();
        let service = Arc::new(Service::new(
            &Config::default(),
            Backends {
                stream: Arc::new(stream.clone()),
                log: Arc::new(log.clone()),
                keys: Arc::new(store.clone()),
                upstream: Arc::new(upstream.clone()),
                leases: Arc::new(MemoryLeaseBackend::new()),
                identity: Arc::new(StaticIdentity::new("10.0.0.1")),
                clock: Arc::new(clock),
            },
        ));
        for key in keys {
            service.pool().enroll("hypixel", key, "ops").await.unwrap();
        }

        let cancel = CancellationToken::new();
        let task = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };
        // Key acquisition and group creation
        tokio::time::sleep(Duration::from_secs(1)).await;

        Self {
            service,
            stream,
            upstream,
            log,
            keys: store,
            clock,
            cancel,
            task,
        }
    }

    /// Hint first seen `age_secs` ago by this replica's clock.
    fn hint(&self, subject: &str, age_secs: i64) -> Hint {
        Hint::new(
            subject,
            "ah",
            self.clock.now() - chrono::Duration::seconds(age_secs),
        )
    }

    fn requeued(&self) -> Vec<Hint> {
        self.stream
            .entries(STREAM)
            .iter()
            .map(|e| e.parse_hint().unwrap())
            .collect()
    }

    async fn send(&self, hint: &Hint) {
        enqueue_hint(&self.stream, STREAM, hint).await.unwrap();
    }

    async fn keys_for(&self, party: &str) -> Vec<ApiKey> {
        self.keys.keys(party).await.unwrap()
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
        assert!(self.service.shutdown(Duration::from_secs(25)).await);
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_hints_refresh_the_subject_once() {
    let replica = Replica::start(&[KEY_A]).await;
    replica.upstream.push(Scripted::Records(vec![UpstreamRecord {
        kind: "auction".into(),
        subject: SUBJECT_A.into(),
        payload: json!({"highest_bid": 500}),
    }]));

    replica.send(&replica.hint(SUBJECT_A, 1)).await;
    replica.send(&replica.hint(SUBJECT_A, 3)).await;
    replica.send(&replica.hint(SUBJECT_A, 2)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(replica.upstream.fetch_calls().len(), 1);
    let published = replica.log.topic("sky-update-auction");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, SUBJECT_A);
    assert_eq!(replica.service.metrics().snapshot().duplicates, 2);

    replica.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stale_batch_is_shed_without_upstream_calls() {
    let replica = Replica::start(&[KEY_A]).await;

    replica.send(&replica.hint(SUBJECT_A, 20)).await;
    replica.send(&replica.hint(SUBJECT_B, 20)).await;
    replica.send(&replica.hint(SUBJECT_C, 20)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(replica.upstream.fetch_calls().is_empty());
    assert_eq!(replica.stream.pending(STREAM, GROUP), 0);
    let snap = replica.service.metrics().snapshot();
    assert_eq!(snap.shed_batches, 1);
    assert_eq!(snap.hints_consumed, 3);

    replica.stop().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_stop_after_three_requeues() {
    let replica = Replica::start(&[KEY_A]).await;
    for _ in 0..4 {
        replica.upstream.push(Scripted::Status(503));
    }

    replica.send(&replica.hint(SUBJECT_A, 0)).await;
    tokio::time::sleep(Duration::from_secs(600)).await;

    let hints = replica.requeued();
    let attempts: Vec<u32> = hints.iter().map(|h| h.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);
    assert_eq!(replica.upstream.fetch_calls().len(), 4);
    // Each requeue lands after a full spacing wait yet carries a fresh stamp
    for pair in hints.windows(2) {
        assert!(pair[1].provided_at - pair[0].provided_at >= chrono::Duration::seconds(40));
    }

    let snap = replica.service.metrics().snapshot();
    assert_eq!(snap.retries, 3);
    assert_eq!(snap.fatal, 1);

    replica.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_key_is_invalidated_and_hint_requeued() {
    let replica = Replica::start(&[KEY_A, KEY_B]).await;
    assert_eq!(replica.service.key_handle().current().as_deref(), Some(KEY_A));
    replica.upstream.push(Scripted::Forbidden);

    replica.send(&replica.hint(SUBJECT_A, 0)).await;
    // One spacing wait plus the error backoff, then the requeued hint runs
    tokio::time::sleep(Duration::from_secs(120)).await;

    let hints = replica.requeued();
    assert_eq!(hints.len(), 2);
    let requeued = &hints[1];
    assert_eq!(requeued.subject, SUBJECT_A);
    assert_eq!(requeued.attempt, 1);
    assert!(requeued.provided_at - hints[0].provided_at >= chrono::Duration::seconds(40));

    let rows = replica.keys_for("hypixel").await;
    assert!(!rows.iter().find(|k| k.key == KEY_A).unwrap().is_valid);
    assert_eq!(replica.service.key_handle().current().as_deref(), Some(KEY_B));

    let calls = replica.upstream.fetch_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, KEY_A);
    assert_eq!(calls[1].1, KEY_B);
    assert_eq!(replica.service.metrics().snapshot().keys_invalidated, 1);

    replica.stop().await;
}

#[tokio::test(start_paused = true)]
async fn manual_hint_is_refreshed() {
    let replica = Replica::start(&[KEY_A]).await;
    let ctx = replica.service.admin_context();

    let body = format!(r#"{{"subject":"{SUBJECT_B}","source":"ops"}}"#);
    let (status, _) = keyward::admin::handle(&ctx, &Method::POST, "/admin/hints", body.as_bytes())
        .await
        .unwrap();
    assert_eq!(status, StatusCode::ACCEPTED);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(replica.upstream.fetches_by_subject().get(SUBJECT_B), Some(&1));
    replica.stop().await;
}

#[tokio::test(start_paused = true)]
async fn no_keys_means_no_consumption() {
    let replica = Replica::start(&[]).await;
    replica.send(&replica.hint(SUBJECT_A, 0)).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(replica.upstream.fetch_calls().is_empty());
    assert!(!replica.service.health().is_ready());

    // Enrolling a key unblocks the replica at the monitor's next attempt
    replica
        .service
        .pool()
        .enroll("hypixel", KEY_A, "ops")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(replica.service.health().is_ready());

    // The waiting hint aged past the freshness window meanwhile
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(replica.upstream.fetch_calls().is_empty());

    replica.stop().await;
}

#[test]
fn dedup_keeps_earliest_and_drops_malformed() {
    let now = Utc::now();
    let t = now - chrono::Duration::seconds(4);
    let entries = vec![
        RawEntry::with_payload("1-0", Hint::new(SUBJECT_A, "ah", t).encode().unwrap()),
        RawEntry::with_payload(
            "2-0",
            Hint::new(SUBJECT_A, "ah", t + chrono::Duration::seconds(2))
                .encode()
                .unwrap(),
        ),
        RawEntry::with_payload("3-0", "{\"Uuid\":"),
    ];

    let outcome = HintDeduplicator::default().dedup(&entries, now);
    assert_eq!(outcome.hints().len(), 1);
    assert_eq!(outcome.hints()[0].provided_at, t);
    assert_eq!(outcome.malformed, 1);
}

fn pool(store: &MemoryKeyStore, identity: &str) -> CredentialPool {
    CredentialPool::new(
        Arc::new(store.clone()),
        Arc::new(StaticIdentity::new(identity)),
        PoolConfig::default(),
    )
}

#[tokio::test]
async fn key_stays_with_its_replica() {
    let store = MemoryKeyStore::new();
    let a = pool(&store, "10.0.0.1");
    let b = pool(&store, "10.0.0.2");
    a.enroll("p", KEY_A, "ops").await.unwrap();

    let first = a.get_key("p", 0).await.unwrap();
    a.used_key("p", &first, 1).await.unwrap();
    assert_eq!(a.get_key("p", 0).await.unwrap(), first);

    match b.get_key("p", 0).await {
        Err(KeywardError::NoKeyAvailable { provider, identity }) => {
            assert_eq!(provider, "p");
            assert_eq!(identity, "10.0.0.2");
        },
        other => panic!("expected NoKeyAvailable, got {other:?}"),
    }
}

#[tokio::test]
async fn invalidating_twice_is_a_no_op() {
    let store = MemoryKeyStore::new();
    let a = pool(&store, "10.0.0.1");
    a.enroll("p", KEY_A, "ops").await.unwrap();

    assert_eq!(a.invalidate_key("p", KEY_A).await.unwrap(), 1);
    let before = a.keys("p").await.unwrap();
    assert_eq!(a.invalidate_key("p", KEY_A).await.unwrap(), 0);
    assert_eq!(a.keys("p").await.unwrap(), before);
    assert!(a.get_key("p", 0).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn replicas_never_hold_a_subject_together() {
    let backend = MemoryLeaseBackend::new();
    let config = LimiterConfig {
        queue_depth: 16,
        ..LimiterConfig::default()
    };
    // One limiter per replica over the shared counters
    let replicas: Vec<Arc<SubjectLeaseLimiter>> = (0..3)
        .map(|_| Arc::new(SubjectLeaseLimiter::new(Arc::new(backend.clone()), config.clone())))
        .collect();
    let subject = SubjectId::parse(SUBJECT_A).unwrap();
    let holders = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let limiter = Arc::clone(&replicas[i % replicas.len()]);
        let subject = subject.clone();
        let holders = Arc::clone(&holders);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            let lease = limiter
                .acquire(&subject, Duration::from_secs(120))
                .await
                .unwrap();
            if lease.acquired() {
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                lease.release().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stream_group_reads_only_new_entries() {
    let stream = MemoryHintStream::new();
    let hint = |subject| Hint::new(subject, "ah", Utc::now());
    enqueue_hint(&stream, STREAM, &hint(SUBJECT_A)).await.unwrap();
    stream.create_group(STREAM, GROUP).await.unwrap();
    enqueue_hint(&stream, STREAM, &hint(SUBJECT_B)).await.unwrap();

    let batch = stream
        .read_group(STREAM, GROUP, "c1", 4, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].parse_hint().unwrap().subject, SUBJECT_B);
}
