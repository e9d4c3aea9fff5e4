//! Refresh hints and the raw stream entries that carry them.
//!
//! A hint travels as JSON under a single stream field:
//!
//! ```text
//! hint = {"Uuid":"<32 hex>","hintSource":"recheck","ProvidedAt":"2024-05-01T12:00:00Z","Try":0}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KeywardError, Result};

/// Stream field holding the JSON-encoded hint.
pub const HINT_FIELD: &str = "hint";

/// Validated subject identifier: a dash-less UUID, 32 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(String);

impl SubjectId {
    pub const LEN: usize = 32;

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.len() != Self::LEN {
            return Err(KeywardError::MalformedInput(format!(
                "subject must be {} characters, got {}",
                Self::LEN,
                trimmed.len()
            )));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KeywardError::MalformedInput(format!(
                "subject {trimmed:?} is not hexadecimal"
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to refresh one subject.
///
/// Hints are never mutated once built; a retry is a new value produced by
/// [`Hint::retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    /// Raw subject token; validated by the executor, not by parsing.
    #[serde(rename = "Uuid")]
    pub subject: String,
    #[serde(rename = "hintSource", default)]
    pub source: String,
    #[serde(rename = "ProvidedAt")]
    pub provided_at: DateTime<Utc>,
    #[serde(rename = "Try", default)]
    pub attempt: u32,
}

impl Hint {
    pub fn new(
        subject: impl Into<String>,
        source: impl Into<String>,
        provided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            source: source.into(),
            provided_at,
            attempt: 0,
        }
    }

    /// Same hint, one attempt later, stamped `requeued_at`.
    ///
    /// A retry goes back on the stream after the subject's lease spacing, so
    /// its age is counted from the requeue rather than the first sighting.
    #[must_use]
    pub fn retry(&self, requeued_at: DateTime<Utc>) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            provided_at: requeued_at,
            ..self.clone()
        }
    }

    /// Age of the hint at `now`; hints stamped in the future count as fresh.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.provided_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn subject_id(&self) -> Result<SubjectId> {
        SubjectId::parse(&self.subject)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| KeywardError::Internal(format!("hint encode failed: {e}")))
    }

    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| KeywardError::MalformedInput(format!("hint decode failed: {e}")))
    }

    /// Field map for appending this hint to a stream.
    pub fn to_fields(&self) -> Result<BTreeMap<String, String>> {
        let mut fields = BTreeMap::new();
        fields.insert(HINT_FIELD.to_string(), self.encode()?);
        Ok(fields)
    }
}

/// One entry as delivered by the stream store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl RawEntry {
    pub fn new(id: impl Into<String>, fields: BTreeMap<String, String>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Convenience constructor for an entry carrying only a hint payload.
    pub fn with_payload(id: impl Into<String>, payload: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(HINT_FIELD.to_string(), payload.into());
        Self::new(id, fields)
    }

    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.fields.get(HINT_FIELD).map(String::as_str)
    }

    pub fn parse_hint(&self) -> Result<Hint> {
        let payload = self.payload().ok_or_else(|| {
            KeywardError::MalformedInput(format!("entry {} has no {HINT_FIELD} field", self.id))
        })?;
        Hint::decode(payload)
    }
}
