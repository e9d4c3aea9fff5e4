//! Consumer-group access to the hint stream.
//!
//! The stream store (cursor, pending entries, group bookkeeping) lives outside
//! the service; [`HintStream`] is the seam. [`MemoryHintStream`] keeps the same
//! semantics in-process: a group is created at the stream's tail, each delivery
//! advances the group cursor and parks the entry as pending until acknowledged.
//! Appends trim the oldest entries past a length cap, like `XADD MAXLEN`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kwd_core::{Hint, RawEntry};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{ClientError, Result};

/// Entries a [`MemoryHintStream`] retains per stream unless told otherwise.
pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;

#[async_trait]
pub trait HintStream: Send + Sync {
    /// Create `group` on `stream`, positioned at the tail.
    ///
    /// Returns [`ClientError::GroupExists`] if the group is already there.
    async fn create_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Deliver up to `count` new entries to `consumer`, waiting at most `block`
    /// for something to arrive. An empty vector means nothing arrived in time.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>>;

    /// Acknowledge delivered entries; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize>;

    /// Append an entry and return its id.
    async fn add(&self, stream: &str, fields: BTreeMap<String, String>) -> Result<String>;
}

/// Append `hint` to `stream` under the hint field.
pub async fn enqueue_hint(stream: &dyn HintStream, name: &str, hint: &Hint) -> Result<String> {
    let fields = hint
        .to_fields()
        .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
    stream.add(name, fields).await
}

#[derive(Debug, Default)]
struct GroupState {
    /// Absolute position of the next undelivered entry.
    cursor: usize,
    /// Entry id to consumer name.
    pending: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<RawEntry>,
    /// Entries dropped from the front; absolute position of `entries[0]`.
    trimmed: usize,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn tail(&self) -> usize {
        self.trimmed + self.entries.len()
    }

    fn trim_to(&mut self, max_len: usize) {
        while self.entries.len() > max_len {
            let Some(dropped) = self.entries.pop_front() else {
                break;
            };
            self.trimmed += 1;
            // A trimmed entry can no longer be claimed, so it stops being pending.
            for group in self.groups.values_mut() {
                group.pending.remove(&dropped.id);
            }
        }
    }
}

/// In-process stream with consumer groups and blocking reads.
#[derive(Debug, Clone)]
pub struct MemoryHintStream {
    streams: Arc<Mutex<HashMap<String, StreamState>>>,
    appended: Arc<Notify>,
    max_len: usize,
}

impl Default for MemoryHintStream {
    fn default() -> Self {
        Self::with_max_len(DEFAULT_STREAM_MAX_LEN)
    }
}

impl MemoryHintStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream that keeps at most `max_len` entries per stream name.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            streams: Arc::default(),
            appended: Arc::default(),
            max_len: max_len.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StreamState>>> {
        self.streams
            .lock()
            .map_err(|e| ClientError::IoError(std::io::Error::other(format!("Lock poisoned: {}", e))))
    }

    /// Entries currently retained on `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock()
            .map(|s| s.get(stream).map_or(0, |st| st.entries.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Entries delivered to `group` but not yet acknowledged.
    pub fn pending(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| {
                s.get(stream)
                    .and_then(|st| st.groups.get(group))
                    .map(|g| g.pending.len())
            })
            .unwrap_or(0)
    }

    /// Retained entries of `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<RawEntry> {
        self.lock()
            .map(|s| {
                s.get(stream)
                    .map(|st| st.entries.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Remove `group` from `stream`, as an operator resetting the store would.
    pub fn drop_group(&self, stream: &str, group: &str) -> bool {
        self.lock()
            .map(|mut s| {
                s.get_mut(stream)
                    .is_some_and(|st| st.groups.remove(group).is_some())
            })
            .unwrap_or(false)
    }

    fn take_batch(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<RawEntry>> {
        let mut streams = self.lock()?;
        let missing = || ClientError::GroupMissing {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = streams.get_mut(stream).ok_or_else(missing)?;
        let group_state = state.groups.get_mut(group).ok_or_else(missing)?;

        // Entries trimmed before delivery are skipped, as Redis does.
        let start = group_state.cursor.max(state.trimmed);
        let end = (state.trimmed + state.entries.len()).min(start + count);
        let batch: Vec<RawEntry> = state
            .entries
            .range(start - state.trimmed..end - state.trimmed)
            .cloned()
            .collect();
        group_state.cursor = end;
        for entry in &batch {
            group_state
                .pending
                .insert(entry.id.clone(), consumer.to_string());
        }
        Ok(batch)
    }
}

#[async_trait]
impl HintStream for MemoryHintStream {
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut streams = self.lock()?;
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(ClientError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let cursor = state.tail();
        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                pending: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<RawEntry>> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before looking so an append between the check
            // and the wait is not missed.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.take_batch(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        let mut streams = self.lock()?;
        let Some(group_state) = streams
            .get_mut(stream)
            .and_then(|st| st.groups.get_mut(group))
        else {
            return Err(ClientError::GroupMissing {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };
        Ok(ids
            .iter()
            .filter(|id| group_state.pending.remove(id.as_str()).is_some())
            .count())
    }

    async fn add(&self, stream: &str, fields: BTreeMap<String, String>) -> Result<String> {
        let id = {
            let mut streams = self.lock()?;
            let state = streams.entry(stream.to_string()).or_default();
            let id = format!("{}-0", state.next_seq);
            state.next_seq += 1;
            state.entries.push_back(RawEntry::new(id.clone(), fields));
            state.trim_to(self.max_len);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }
}
