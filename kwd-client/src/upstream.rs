//! Rate-limited third-party API.
//!
//! [`HttpUpstream`] talks to the real service over reqwest; [`ScriptedUpstream`]
//! replays queued answers so the pipeline can be exercised without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kwd_core::SubjectId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClientError, Result};

/// One record returned for a subject, tagged with the kind that selects its
/// downstream topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub kind: String,
    pub subject: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Check that `key` is accepted. [`ClientError::Forbidden`] means it is not.
    async fn validate_key(&self, key: &str) -> Result<()>;

    /// Fetch current records for `subject` using `key`.
    async fn fetch_subject(&self, subject: &SubjectId, key: &str) -> Result<Vec<UpstreamRecord>>;
}

/// Where the key travels on upstream requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum KeyPlacement {
    Query(String),
    Header(String),
}

impl Default for KeyPlacement {
    fn default() -> Self {
        Self::Query("key".to_string())
    }
}

/// Connection settings for [`HttpUpstream`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub key_placement: KeyPlacement,
    /// Path used by [`UpstreamApi::validate_key`].
    pub validate_path: String,
    /// Path template; `{subject}` is replaced with the subject id.
    pub subject_path: String,
    /// Array field in the response holding the records.
    pub records_field: String,
    pub record_kind: String,
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hypixel.net/".to_string(),
            key_placement: KeyPlacement::default(),
            validate_path: "key".to_string(),
            subject_path: "skyblock/auction?player={subject}".to_string(),
            records_field: "auctions".to_string(),
            record_kind: "auction".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_key_placement(mut self, placement: KeyPlacement) -> Self {
        self.key_placement = placement;
        self
    }

    pub fn with_subject_path(mut self, template: impl Into<String>) -> Self {
        self.subject_path = template.into();
        self
    }

    pub fn with_records(mut self, field: impl Into<String>, kind: impl Into<String>) -> Self {
        self.records_field = field.into();
        self.record_kind = kind.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    async fn get(&self, path: &str, key: &str) -> Result<serde_json::Value> {
        let request = self.client.get(self.config.url(path));
        let request = match &self.config.key_placement {
            KeyPlacement::Query(name) => request.query(&[(name.as_str(), key)]),
            KeyPlacement::Header(name) => request.header(name.as_str(), key),
        };
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if let Some(err) = ClientError::from_status(status, &body) {
            return Err(err);
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn validate_key(&self, key: &str) -> Result<()> {
        self.get(&self.config.validate_path, key).await.map(|_| ())
    }

    async fn fetch_subject(&self, subject: &SubjectId, key: &str) -> Result<Vec<UpstreamRecord>> {
        let path = self
            .config
            .subject_path
            .replace("{subject}", subject.as_str());
        let body = self.get(&path, key).await?;
        let records = extract_records(
            &body,
            &self.config.records_field,
            &self.config.record_kind,
            subject,
        )?;
        debug!(
            target: "keyward::upstream",
            subject = %subject,
            records = records.len(),
            "Fetched subject"
        );
        Ok(records)
    }
}

/// Pull the record array out of a response body. A missing or null field is
/// an empty result; anything else that is not an array is invalid.
pub fn extract_records(
    body: &serde_json::Value,
    field: &str,
    kind: &str,
    subject: &SubjectId,
) -> Result<Vec<UpstreamRecord>> {
    match body.get(field) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => Ok(items
            .iter()
            .map(|payload| UpstreamRecord {
                kind: kind.to_string(),
                subject: subject.to_string(),
                payload: payload.clone(),
            })
            .collect()),
        Some(other) => Err(ClientError::InvalidResponse(format!(
            "field {} is not an array: {}",
            field, other
        ))),
    }
}

/// One queued answer for [`ScriptedUpstream`].
#[derive(Debug, Clone)]
pub enum Scripted {
    Records(Vec<UpstreamRecord>),
    Forbidden,
    Status(u16),
    Timeout,
}

impl Scripted {
    fn into_result(self) -> Result<Vec<UpstreamRecord>> {
        match self {
            Self::Records(records) => Ok(records),
            Self::Forbidden => Err(ClientError::Forbidden { status: 403 }),
            Self::Status(status) => Err(ClientError::Status {
                status,
                body: String::new(),
            }),
            Self::Timeout => Err(ClientError::Timeout),
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    fetches: VecDeque<Scripted>,
    rejected_keys: Vec<String>,
    fetch_calls: Vec<(String, String)>,
    validate_calls: Vec<String>,
    fetch_delay: Duration,
}

/// Programmable upstream. Queued answers are consumed in order; once the queue
/// is empty every fetch succeeds with no records. Keys marked rejected fail
/// both validation and fetches with 403.
#[derive(Debug, Default, Clone)]
pub struct ScriptedUpstream {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every update to the script is a single push or assignment, so state
    /// left behind by a panicking holder is still whole and is used as is.
    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn push(&self, answer: Scripted) {
        self.with_state(|s| s.fetches.push_back(answer));
    }

    pub fn reject_key(&self, key: impl Into<String>) {
        let key = key.into();
        self.with_state(|s| s.rejected_keys.push(key));
    }

    /// Delay applied to every fetch before answering.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.with_state(|s| s.fetch_delay = delay);
    }

    /// `(subject, key)` per fetch, in call order.
    pub fn fetch_calls(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.fetch_calls.clone())
    }

    pub fn validate_calls(&self) -> Vec<String> {
        self.with_state(|s| s.validate_calls.clone())
    }

    /// Fetch counts per subject.
    pub fn fetches_by_subject(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (subject, _) in self.fetch_calls() {
            *counts.entry(subject).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl UpstreamApi for ScriptedUpstream {
    async fn validate_key(&self, key: &str) -> Result<()> {
        let rejected = self.with_state(|s| {
            s.validate_calls.push(key.to_string());
            s.rejected_keys.iter().any(|k| k == key)
        });
        if rejected {
            Err(ClientError::Forbidden { status: 403 })
        } else {
            Ok(())
        }
    }

    async fn fetch_subject(&self, subject: &SubjectId, key: &str) -> Result<Vec<UpstreamRecord>> {
        let (delay, rejected, answer) = self.with_state(|s| {
            s.fetch_calls.push((subject.to_string(), key.to_string()));
            let rejected = s.rejected_keys.iter().any(|k| k == key);
            let answer = if rejected { None } else { s.fetches.pop_front() };
            (s.fetch_delay, rejected, answer)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if rejected {
            return Err(ClientError::Forbidden { status: 403 });
        }
        answer.map_or_else(|| Ok(Vec::new()), Scripted::into_result)
    }
}
