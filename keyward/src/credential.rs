//! Shared pool of upstream API keys.
//!
//! Every replica draws from the same key table. Selection prefers the key this
//! replica used last (its affinity), then any valid key nobody holds or whose
//! holder has not touched it within the staleness window. Recording a use moves
//! the replica's affinity onto that key, so each replica sticks to one key per
//! provider.
//!
//! All reads and writes go through one async mutex; nothing else writes the
//! store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kwd_client::{IdentityResolver, KeyStore};
use kwd_core::{ApiKey, KeywardError, Result, redact};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// A held key whose last use is older than this may be taken over.
    pub staleness_window: Duration,
    /// Minimum time between usage writes for one key.
    pub usage_flush_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(20 * 60),
            usage_flush_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct PendingUsage {
    unflushed: u64,
    last_write: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Keyed by (provider, key)
    usage: HashMap<(String, String), PendingUsage>,
}

pub struct CredentialPool {
    store: Arc<dyn KeyStore>,
    identity: Arc<dyn IdentityResolver>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn KeyStore>,
        identity: Arc<dyn IdentityResolver>,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            identity,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub async fn identity(&self) -> Result<String> {
        Ok(self.identity.resolve().await?)
    }

    /// Pick a key for `provider`, recording `add_uses` uses when non-zero.
    pub async fn get_key(&self, provider: &str, add_uses: u64) -> Result<String> {
        let identity = self.identity().await?;
        let _guard = self.state.lock().await;

        let rows = self.store.keys(provider).await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.staleness_window)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let chosen = rows
            .iter()
            .find(|k| k.is_valid && k.is_affine_to(&identity))
            .or_else(|| {
                rows.iter().find(|k| {
                    k.is_valid && (k.last_server_affinity.is_none() || k.last_used < cutoff)
                })
            })
            .ok_or_else(|| KeywardError::NoKeyAvailable {
                provider: provider.to_string(),
                identity: identity.clone(),
            })?;

        let key = chosen.key.clone();
        debug!(
            target: "keyward::credential",
            provider,
            key = %redact(&key),
            affine = chosen.is_affine_to(&identity),
            "Selected key"
        );

        if add_uses > 0 {
            self.store_use(provider, &key, add_uses, &identity).await?;
        }
        Ok(key)
    }

    /// Record `times` uses of `key`. The first use of a key is written at once;
    /// later ones accumulate and are written by the first call after the flush
    /// interval has passed, or by [`CredentialPool::flush_usage`].
    pub async fn used_key(&self, provider: &str, key: &str, times: u64) -> Result<()> {
        let identity = self.identity().await?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let slot = (provider.to_string(), key.to_string());

        let to_write = match state.usage.get_mut(&slot) {
            None => {
                state.usage.insert(
                    slot,
                    PendingUsage {
                        unflushed: 0,
                        last_write: now,
                    },
                );
                times
            },
            Some(pending) => {
                pending.unflushed += times;
                if now.duration_since(pending.last_write) < self.config.usage_flush_interval {
                    return Ok(());
                }
                pending.last_write = now;
                std::mem::take(&mut pending.unflushed)
            },
        };

        self.store_use(provider, key, to_write, &identity).await
    }

    /// Write every accumulated use. Called on shutdown.
    pub async fn flush_usage(&self) -> Result<usize> {
        let identity = self.identity().await?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut flushed = 0;

        for ((provider, key), pending) in &mut state.usage {
            if pending.unflushed == 0 {
                continue;
            }
            let times = std::mem::take(&mut pending.unflushed);
            pending.last_write = now;
            self.store_use(provider, key, times, &identity).await?;
            flushed += 1;
        }

        if flushed > 0 {
            info!(target: "keyward::credential", keys = flushed, "Flushed key usage");
        }
        Ok(flushed)
    }

    /// Mark every row carrying `key` invalid. Returns how many rows changed;
    /// already-invalid rows are left alone.
    pub async fn invalidate_key(&self, provider: &str, key: &str) -> Result<usize> {
        let _guard = self.state.lock().await;
        let mut changed = 0;
        for mut row in self.store.keys(provider).await? {
            if row.key == key && row.is_valid {
                row.is_valid = false;
                self.store.save(&row).await?;
                changed += 1;
            }
        }
        if changed > 0 {
            warn!(
                target: "keyward::credential",
                provider,
                key = %redact(key),
                rows = changed,
                "Key invalidated"
            );
        }
        Ok(changed)
    }

    pub async fn enroll(&self, party: &str, key: &str, owner: &str) -> Result<ApiKey> {
        if party.trim().is_empty() || key.trim().is_empty() {
            return Err(KeywardError::MalformedInput(
                "party and key must not be empty".into(),
            ));
        }
        let _guard = self.state.lock().await;
        let row = self
            .store
            .insert(ApiKey::enroll(party.trim(), key.trim(), owner.trim()))
            .await?;
        info!(
            target: "keyward::credential",
            party = %row.party,
            key = %row.redacted(),
            owner = %row.owner,
            id = row.id,
            "Key enrolled"
        );
        Ok(row)
    }

    pub async fn active_key_count(&self, provider: &str) -> Result<usize> {
        let _guard = self.state.lock().await;
        Ok(self
            .store
            .keys(provider)
            .await?
            .iter()
            .filter(|k| k.is_valid)
            .count())
    }

    pub async fn keys(&self, provider: &str) -> Result<Vec<ApiKey>> {
        let _guard = self.state.lock().await;
        Ok(self.store.keys(provider).await?)
    }

    /// Caller must hold the state lock.
    async fn store_use(&self, provider: &str, key: &str, times: u64, identity: &str) -> Result<()> {
        let rows = self.store.keys(provider).await?;
        let Some(mut row) = rows.iter().find(|r| r.key == key).cloned() else {
            debug!(
                target: "keyward::credential",
                provider,
                key = %redact(key),
                "Use recorded for unknown key"
            );
            return Ok(());
        };

        row.last_used = Utc::now();
        row.use_count += times;
        row.last_server_affinity = Some(identity.to_string());
        self.store.save(&row).await?;

        // One sticky key per replica and provider
        if row.is_valid {
            for other in rows
                .iter()
                .filter(|r| r.id != row.id && r.is_affine_to(identity))
            {
                let mut other = other.clone();
                other.last_server_affinity = None;
                self.store.save(&other).await?;
            }
        }
        Ok(())
    }
}
