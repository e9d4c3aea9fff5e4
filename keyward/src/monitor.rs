//! Active key acquisition and health checks.
//!
//! [`KeyHandle`] carries the key the replica is currently using. The monitor
//! fills it on startup, re-validates it periodically, and replaces it when the
//! executor reports it rejected.

use std::sync::Arc;
use std::time::Duration;

use kwd_client::UpstreamApi;
use kwd_core::{JitterBackoff, KeywardError, redact};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::credential::CredentialPool;
use crate::metrics::PipelineMetrics;

/// Shared view of the active key.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    tx: Arc<watch::Sender<Option<String>>>,
    invalidated: Arc<Notify>,
}

impl Default for KeyHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            invalidated: Arc::new(Notify::new()),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, key: String) {
        self.tx.send_replace(Some(key));
    }

    /// Report that upstream rejected `key`. Clears it if it is still the
    /// active key and wakes the monitor.
    pub fn report_invalid(&self, key: &str) {
        if self.clear(key) {
            self.invalidated.notify_one();
        }
    }

    fn clear(&self, key: &str) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(key) {
                *current = None;
                true
            } else {
                false
            }
        })
    }

    /// Wait until a key is published. `None` on cancellation.
    pub async fn wait_for_key(&self, cancel: &CancellationToken) -> Option<String> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(key) = rx.borrow_and_update().clone() {
                return Some(key);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn invalidation(&self) {
        self.invalidated.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub provider: String,
    pub revalidate_interval: Duration,
    /// Wait before asking again when no key is available.
    pub key_retry_delay: Duration,
    pub invalid_key_delay_min: Duration,
    pub invalid_key_delay_max: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            provider: kwd_core::DEFAULT_PROVIDER.to_string(),
            revalidate_interval: Duration::from_secs(60 * 60),
            key_retry_delay: Duration::from_secs(15),
            invalid_key_delay_min: Duration::from_secs(1),
            invalid_key_delay_max: Duration::from_secs(500),
        }
    }
}

pub struct KeyHealthMonitor {
    pool: Arc<CredentialPool>,
    upstream: Arc<dyn UpstreamApi>,
    handle: KeyHandle,
    metrics: Arc<PipelineMetrics>,
    config: MonitorConfig,
    invalid_backoff: JitterBackoff,
}

impl KeyHealthMonitor {
    pub fn new(
        pool: Arc<CredentialPool>,
        upstream: Arc<dyn UpstreamApi>,
        handle: KeyHandle,
        metrics: Arc<PipelineMetrics>,
        config: MonitorConfig,
    ) -> Self {
        let invalid_backoff =
            JitterBackoff::new(config.invalid_key_delay_min, config.invalid_key_delay_max);
        Self {
            pool,
            upstream,
            handle,
            metrics,
            config,
            invalid_backoff,
        }
    }

    pub fn handle(&self) -> &KeyHandle {
        &self.handle
    }

    /// Draw keys from the pool until one passes validation, then publish it.
    /// Returns `None` only on cancellation.
    pub async fn acquire_valid_key(&self, cancel: &CancellationToken) -> Option<String> {
        let provider = self.config.provider.as_str();
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let key = match self.pool.get_key(provider, 0).await {
                Ok(key) => key,
                Err(e @ KeywardError::NoKeyAvailable { .. }) => {
                    info!(target: "keyward::monitor", error = %e, "Waiting for a key");
                    if !sleep_or_cancel(self.config.key_retry_delay, cancel).await {
                        return None;
                    }
                    continue;
                },
                Err(e) => {
                    error!(target: "keyward::monitor", error = %e, "Key lookup failed");
                    if !sleep_or_cancel(self.config.key_retry_delay, cancel).await {
                        return None;
                    }
                    continue;
                },
            };

            match self.upstream.validate_key(&key).await {
                Ok(()) => {},
                Err(e) if e.is_auth_failure() => {
                    info!(target: "keyward::monitor", key = %redact(&key), "Key is invalid");
                    self.invalidate(&key).await;
                    if !sleep_or_cancel(self.invalid_backoff.next_delay(), cancel).await {
                        return None;
                    }
                    continue;
                },
                Err(e) => {
                    // Upstream trouble says nothing about the key itself
                    warn!(
                        target: "keyward::monitor",
                        key = %redact(&key),
                        error = %e,
                        "Key validation inconclusive, keeping key"
                    );
                },
            }

            if let Err(e) = self.pool.used_key(provider, &key, 1).await {
                warn!(target: "keyward::monitor", error = %e, "Recording key use failed");
            }
            info!(target: "keyward::monitor", key = %redact(&key), "Active key ready");
            self.handle.publish(key.clone());
            return Some(key);
        }
    }

    /// Keep a valid key published until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.acquire_valid_key(&cancel).await.is_none() {
            return;
        }

        let mut revalidate = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.revalidate_interval,
            self.config.revalidate_interval,
        );
        revalidate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(target: "keyward::monitor", "Key monitor stopping");
                    return;
                }
                _ = self.handle.invalidation() => {
                    info!(target: "keyward::monitor", "Active key rejected, acquiring another");
                }
                _ = revalidate.tick() => {
                    if !self.revalidate_current().await {
                        continue;
                    }
                }
            }
            if self.acquire_valid_key(&cancel).await.is_none() {
                return;
            }
        }
    }

    /// Returns true when the active key must be replaced.
    async fn revalidate_current(&self) -> bool {
        let Some(key) = self.handle.current() else {
            return true;
        };
        match self.upstream.validate_key(&key).await {
            Ok(()) => false,
            Err(e) if e.is_auth_failure() => {
                info!(target: "keyward::monitor", key = %redact(&key), "Active key failed revalidation");
                self.invalidate(&key).await;
                self.handle.clear(&key);
                true
            },
            Err(e) => {
                warn!(target: "keyward::monitor", error = %e, "Revalidation inconclusive");
                false
            },
        }
    }

    async fn invalidate(&self, key: &str) {
        match self.pool.invalidate_key(&self.config.provider, key).await {
            Ok(changed) if changed > 0 => self.metrics.key_invalidated(),
            Ok(_) => {},
            Err(e) => warn!(target: "keyward::monitor", error = %e, "Invalidation failed"),
        }
    }
}

/// Sleep for `delay`; false if cancelled first.
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
