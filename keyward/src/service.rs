//! Wires the pipeline together for one replica.

use std::sync::Arc;
use std::time::Duration;

use kwd_client::{HintStream, IdentityResolver, KeyStore, LeaseBackend, RecordLog, UpstreamApi};
use kwd_core::{Clock, HintDeduplicator};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::admin::AdminContext;
use crate::config::Config;
use crate::credential::CredentialPool;
use crate::executor::UpdateExecutor;
use crate::health::HealthState;
use crate::ingestion::IngestionLoop;
use crate::limiter::SubjectLeaseLimiter;
use crate::metrics::PipelineMetrics;
use crate::monitor::{KeyHandle, KeyHealthMonitor};
use crate::shutdown;

/// External collaborators a replica talks to.
pub struct Backends {
    pub stream: Arc<dyn HintStream>,
    pub log: Arc<dyn RecordLog>,
    pub keys: Arc<dyn KeyStore>,
    pub upstream: Arc<dyn UpstreamApi>,
    pub leases: Arc<dyn LeaseBackend>,
    pub identity: Arc<dyn IdentityResolver>,
    /// Wall clock for hint ages and requeue stamps.
    pub clock: Arc<dyn Clock>,
}

pub struct Service {
    pool: Arc<CredentialPool>,
    monitor: Arc<KeyHealthMonitor>,
    ingestion: Arc<IngestionLoop>,
    key_handle: KeyHandle,
    metrics: Arc<PipelineMetrics>,
    health: Arc<HealthState>,
    tracker: TaskTracker,
    admin: AdminContext,
}

impl Service {
    pub fn new(config: &Config, backends: Backends) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let key_handle = KeyHandle::new();
        let tracker = TaskTracker::new();
        let dedup = HintDeduplicator::new(config.staleness_policy());

        let pool = Arc::new(CredentialPool::new(
            backends.keys,
            backends.identity,
            config.pool_config(),
        ));
        let limiter = Arc::new(SubjectLeaseLimiter::new(
            backends.leases,
            config.limiter_config(),
        ));
        let executor = Arc::new(UpdateExecutor::new(
            Arc::clone(&pool),
            limiter,
            Arc::clone(&backends.upstream),
            backends.log,
            dedup.clone(),
            key_handle.clone(),
            Arc::clone(&metrics),
            Arc::clone(&backends.clock),
            config.executor_config(),
        ));
        let ingestion = Arc::new(IngestionLoop::new(
            Arc::clone(&backends.stream),
            executor,
            dedup,
            key_handle.clone(),
            Arc::clone(&metrics),
            tracker.clone(),
            Arc::clone(&backends.clock),
            config.ingestion_config(),
        ));
        let monitor = Arc::new(KeyHealthMonitor::new(
            Arc::clone(&pool),
            backends.upstream,
            key_handle.clone(),
            Arc::clone(&metrics),
            config.monitor_config(),
        ));
        let admin = AdminContext {
            pool: Arc::clone(&pool),
            stream: backends.stream,
            stream_name: config.stream.name.clone(),
            provider: config.credentials.provider.clone(),
            metrics: Arc::clone(&metrics),
            key_handle: key_handle.clone(),
            clock: backends.clock,
        };

        Self {
            pool,
            monitor,
            ingestion,
            key_handle,
            metrics,
            health: Arc::new(HealthState::new()),
            tracker,
            admin,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn key_handle(&self) -> &KeyHandle {
        &self.key_handle
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn admin_context(&self) -> AdminContext {
        self.admin.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Run the key monitor and the ingestion loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let monitor = {
            let monitor = Arc::clone(&self.monitor);
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };
        let readiness = tokio::spawn(track_readiness(
            self.key_handle.clone(),
            Arc::clone(&self.health),
            cancel.clone(),
        ));

        self.health.set_startup_complete();
        self.ingestion.run(cancel.clone()).await;

        for (name, task) in [("monitor", monitor), ("readiness", readiness)] {
            if let Err(e) = task.await {
                error!(target: "keyward::service", task = name, error = %e, "Task failed");
            }
        }
    }

    /// Drain hint tasks and flush buffered key usage. Returns false if the
    /// drain timed out.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.health.set_draining();
        let clean = shutdown::drain_with_timeout(&self.tracker, drain_timeout).await;
        match self.pool.flush_usage().await {
            Ok(flushed) => {
                info!(target: "keyward::service", flushed, "Key usage flushed");
            },
            Err(e) => {
                warn!(target: "keyward::service", error = %e, "Key usage flush failed");
            },
        }
        self.health.set_not_alive();
        clean
    }
}

/// Mirror the published key into [`HealthState`]; cancellation starts the drain.
async fn track_readiness(handle: KeyHandle, health: Arc<HealthState>, cancel: CancellationToken) {
    let mut rx = handle.subscribe();
    loop {
        health.set_key_published(rx.borrow_and_update().is_some());
        tokio::select! {
            _ = cancel.cancelled() => {
                health.set_draining();
                return;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::TimerClock;
    use crate::health::Readiness;
    use kwd_client::{
        MemoryHintStream, MemoryKeyStore, MemoryLeaseBackend, MemoryRecordLog, ScriptedUpstream,
        StaticIdentity,
    };

    fn service() -> Service {
        Service::new(
            &Config::default(),
            Backends {
                stream: Arc::new(MemoryHintStream::new()),
                log: Arc::new(MemoryRecordLog::new()),
                keys: Arc::new(MemoryKeyStore::new()),
                upstream: Arc::new(ScriptedUpstream::new()),
                leases: Arc::new(MemoryLeaseBackend::new()),
                identity: Arc::new(StaticIdentity::new("10.0.0.1")),
                clock: Arc::new(TimerClock::new()),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_once_a_key_is_published() {
        let service = Arc::new(service());
        service
            .pool()
            .enroll("hypixel", "0123456789abcdef", "ops")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(service.health().is_startup_complete());
        assert!(service.health().is_ready());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(service.health().readiness(), Readiness::Draining);
        assert!(service.health().is_alive());
        assert!(service.shutdown(Duration::from_secs(5)).await);
        assert!(!service.health().is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_without_keys() {
        let service = Arc::new(service());
        let cancel = CancellationToken::new();
        let task = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(service.health().readiness(), Readiness::AwaitingKey);
        assert!(service.key_handle().current().is_none());

        cancel.cancel();
        task.await.unwrap();
    }
}
