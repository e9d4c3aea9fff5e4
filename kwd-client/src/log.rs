//! Downstream record log.
//!
//! Refreshed records are republished for other consumers, one topic per
//! record kind, keyed by subject. Delivery is at-least-once; consumers are
//! expected to be idempotent.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait RecordLog: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;
}

/// A record as captured by [`MemoryRecordLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

/// Collects everything published; for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordLog {
    records: Arc<Mutex<Vec<PublishedRecord>>>,
}

impl MemoryRecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublishedRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn topic(&self, topic: &str) -> Vec<PublishedRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }
}

#[async_trait]
impl RecordLog for MemoryRecordLog {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let mut records = self.records.lock().map_err(|e| {
            ClientError::IoError(std::io::Error::other(format!("Lock poisoned: {}", e)))
        })?;
        records.push(PublishedRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}

/// One line of a [`FileRecordLog`] topic file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub key: String,
    pub at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Appends records as JSON lines, one file per topic:
/// ```text
/// {base_dir}/
/// ├── sky-update-auction.jsonl
/// └── ...
/// ```
#[derive(Debug)]
pub struct FileRecordLog {
    base_dir: PathBuf,
    // Serializes appends per topic file
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileRecordLog {
    pub fn open(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(ClientError::IoError)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn topic_path(&self, topic: &str) -> PathBuf {
        let safe: String = topic
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_dir.join(format!("{}.jsonl", safe))
    }

    fn writer_lock(&self, topic: &str) -> Result<Arc<Mutex<()>>> {
        let mut writers = self.writers.lock().map_err(|e| {
            ClientError::IoError(std::io::Error::other(format!("Lock poisoned: {}", e)))
        })?;
        Ok(Arc::clone(writers.entry(topic.to_string()).or_default()))
    }

    /// Read back every line of `topic`; lines that fail to parse are skipped.
    pub fn read_topic(&self, topic: &str) -> Result<Vec<LogLine>> {
        let content = match fs::read_to_string(self.topic_path(topic)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ClientError::IoError(e)),
        };
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[async_trait]
impl RecordLog for FileRecordLog {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let payload = serde_json::from_slice(&payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&payload).into_owned())
        });
        let line = LogLine {
            key: key.to_string(),
            at: Utc::now(),
            payload,
        };
        let mut encoded = serde_json::to_vec(&line)
            .map_err(|e| ClientError::IoError(std::io::Error::other(e)))?;
        encoded.push(b'\n');

        let lock = self.writer_lock(topic)?;
        let path = self.topic_path(topic);
        tokio::task::spawn_blocking(move || append_line(&path, &lock, &encoded))
            .await
            .map_err(|e| ClientError::IoError(std::io::Error::other(e)))?
    }
}

/// Append one encoded line; runs on the blocking pool.
fn append_line(path: &Path, lock: &Mutex<()>, encoded: &[u8]) -> Result<()> {
    let _guard = lock.lock().map_err(|e| {
        ClientError::IoError(std::io::Error::other(format!("Lock poisoned: {}", e)))
    })?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(encoded)?;
    file.flush()?;
    Ok(())
}
