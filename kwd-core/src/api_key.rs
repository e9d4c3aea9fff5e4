use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Characters of a key that may appear in logs and admin listings.
pub const REDACTED_PREFIX_LEN: usize = 10;

/// One credential row as persisted by the key store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Row id assigned by the store; `0` until inserted.
    #[serde(default)]
    pub id: u64,
    /// Provider the key belongs to.
    pub party: String,
    pub key: String,
    #[serde(default)]
    pub owner: String,
    /// Identity of the replica that last used the key.
    #[serde(default)]
    pub last_server_affinity: Option<String>,
    #[serde(default)]
    pub use_count: u64,
    pub is_valid: bool,
    pub last_used: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl ApiKey {
    /// A fresh, valid, unaffiliated key as produced by enrollment.
    pub fn enroll(
        party: impl Into<String>,
        key: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            party: party.into(),
            key: key.into(),
            owner: owner.into(),
            last_server_affinity: None,
            use_count: 0,
            is_valid: true,
            last_used: now,
            created: now,
        }
    }

    #[must_use]
    pub fn redacted(&self) -> String {
        redact(&self.key)
    }

    #[must_use]
    pub fn is_affine_to(&self, identity: &str) -> bool {
        self.last_server_affinity.as_deref() == Some(identity)
    }
}

/// Truncates a secret for logging.
#[must_use]
pub fn redact(key: &str) -> String {
    let prefix: String = key.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enroll_defaults() {
        let key = ApiKey::enroll("hypixel", "0123456789abcdef", "ops");
        assert!(key.is_valid);
        assert_eq!(key.use_count, 0);
        assert!(key.last_server_affinity.is_none());
        assert_eq!(key.id, 0);
    }

    #[test]
    fn test_redaction_keeps_prefix_only() {
        assert_eq!(redact("0123456789abcdef"), "0123456789…");
        assert_eq!(redact("abc"), "abc…");
    }

    #[test]
    fn test_affinity() {
        let mut key = ApiKey::enroll("hypixel", "k", "ops");
        assert!(!key.is_affine_to("10.0.0.1"));
        key.last_server_affinity = Some("10.0.0.1".into());
        assert!(key.is_affine_to("10.0.0.1"));
        assert!(!key.is_affine_to("10.0.0.2"));
    }
}
