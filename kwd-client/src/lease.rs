//! Shared counting primitive behind the per-subject lease limiter.
//!
//! Counters are bounded and expire `ttl` after their last increment, so the
//! holdings of a replica that died without releasing eventually disappear.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{ClientError, Result};

#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Increment `counter` if it is below `limit`, refreshing its expiry.
    /// Returns false without changing anything when the limit is reached.
    async fn try_increment(&self, counter: &str, limit: u32, ttl: Duration) -> Result<bool>;

    /// Decrement `counter`, never below zero.
    async fn decrement(&self, counter: &str) -> Result<()>;

    /// Current value; expired counters read as zero.
    async fn value(&self, counter: &str) -> Result<u32>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u32,
    expires_at: Instant,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLeaseBackend {
    counters: Arc<Mutex<HashMap<String, Counter>>>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Counter>>> {
        self.counters
            .lock()
            .map_err(|e| ClientError::IoError(std::io::Error::other(format!("Lock poisoned: {}", e))))
    }

    /// Number of live, non-zero counters.
    pub fn live_counters(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|c| {
                c.values()
                    .filter(|c| c.value > 0 && c.expires_at > now)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn try_increment(&self, counter: &str, limit: u32, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut counters = self.lock()?;
        let entry = counters.entry(counter.to_string()).or_insert(Counter {
            value: 0,
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.value = 0;
        }
        if entry.value >= limit {
            return Ok(false);
        }
        entry.value += 1;
        entry.expires_at = now + ttl;
        Ok(true)
    }

    async fn decrement(&self, counter: &str) -> Result<()> {
        let now = Instant::now();
        let mut counters = self.lock()?;
        if let Some(entry) = counters.get_mut(counter) {
            if entry.expires_at <= now {
                entry.value = 0;
            }
            entry.value = entry.value.saturating_sub(1);
            if entry.value == 0 {
                counters.remove(counter);
            }
        }
        Ok(())
    }

    async fn value(&self, counter: &str) -> Result<u32> {
        let now = Instant::now();
        let counters = self.lock()?;
        Ok(counters
            .get(counter)
            .filter(|c| c.expires_at > now)
            .map_or(0, |c| c.value))
    }
}
