//! Cluster-wide per-subject concurrency gate.
//!
//! Two counters per subject live in the shared [`LeaseBackend`]:
//!
//! ```text
//! lease:{subject}:queue    callers holding or waiting, bounded by queue_depth
//! lease:{subject}:permits  callers holding, bounded by permits
//! ```
//!
//! A caller that cannot join the queue is turned away at once. A queued caller
//! polls for a permit until its timeout runs out. Both counters carry a TTL so a
//! replica that dies while holding a lease cannot block the subject forever.

use std::sync::Arc;
use std::time::Duration;

use kwd_client::LeaseBackend;
use kwd_core::{Result, SubjectId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub permits: u32,
    pub queue_depth: u32,
    pub acquire_timeout: Duration,
    pub ttl: Duration,
    /// How often a queued caller re-checks the permit counter.
    pub poll_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            permits: 1,
            queue_depth: 1,
            acquire_timeout: Duration::from_secs(30),
            ttl: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
        }
    }
}

pub struct SubjectLeaseLimiter {
    backend: Arc<dyn LeaseBackend>,
    config: LimiterConfig,
}

impl SubjectLeaseLimiter {
    pub fn new(backend: Arc<dyn LeaseBackend>, config: LimiterConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub async fn acquire(&self, subject: &SubjectId, timeout: Duration) -> Result<Lease> {
        self.acquire_cancellable(subject, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`SubjectLeaseLimiter::acquire`], giving up early when `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        subject: &SubjectId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        let queue_key = format!("lease:{}:queue", subject);
        let permit_key = format!("lease:{}:permits", subject);

        if !self
            .backend
            .try_increment(&queue_key, self.config.queue_depth, self.config.ttl)
            .await?
        {
            debug!(target: "keyward::limiter", subject = %subject, "Queue full, rejecting");
            return Ok(Lease::not_acquired(subject));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self
                .backend
                .try_increment(&permit_key, self.config.permits, self.config.ttl)
                .await
            {
                Ok(true) => {
                    return Ok(Lease {
                        subject: subject.to_string(),
                        held: Some(Held {
                            backend: Arc::clone(&self.backend),
                            queue_key,
                            permit_key,
                        }),
                    });
                },
                Ok(false) => {},
                Err(e) => {
                    self.leave_queue(&queue_key).await;
                    return Err(e.into());
                },
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(target: "keyward::limiter", subject = %subject, "Timed out waiting for permit");
                self.leave_queue(&queue_key).await;
                return Ok(Lease::not_acquired(subject));
            }
            let wait = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.leave_queue(&queue_key).await;
                    return Ok(Lease::not_acquired(subject));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn leave_queue(&self, queue_key: &str) {
        if let Err(e) = self.backend.decrement(queue_key).await {
            warn!(target: "keyward::limiter", counter = queue_key, error = %e, "Queue release failed");
        }
    }
}

struct Held {
    backend: Arc<dyn LeaseBackend>,
    queue_key: String,
    permit_key: String,
}

impl Held {
    async fn release(self) {
        for counter in [&self.permit_key, &self.queue_key] {
            if let Err(e) = self.backend.decrement(counter).await {
                warn!(target: "keyward::limiter", counter = %counter, error = %e, "Lease release failed");
            }
        }
    }
}

/// Result of an acquire attempt. Check [`Lease::acquired`] before doing the
/// guarded work. Dropping an acquired lease without calling
/// [`Lease::release`] still releases it, on a spawned task.
pub struct Lease {
    subject: String,
    held: Option<Held>,
}

impl Lease {
    fn not_acquired(subject: &SubjectId) -> Self {
        Self {
            subject: subject.to_string(),
            held: None,
        }
    }

    pub fn acquired(&self) -> bool {
        self.held.is_some()
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn release(mut self) {
        if let Some(held) = self.held.take() {
            held.release().await;
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(held.release());
            },
            Err(_) => {
                warn!(
                    target: "keyward::limiter",
                    subject = %self.subject,
                    "Lease dropped outside a runtime; counters will expire by TTL"
                );
            },
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("subject", &self.subject)
            .field("acquired", &self.acquired())
            .finish()
    }
}
