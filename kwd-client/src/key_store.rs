//! Persistence for credential rows.
//!
//! The credential pool is the only writer. Two implementations:
//!
//! - [`MemoryKeyStore`]: process-local, for tests and single-replica dry runs
//! - [`JsonFileKeyStore`]: the full table in one JSON document, rewritten
//!   atomically (temp file, fsync, rename) on every change
//!
//! ```text
//! {data_dir}/
//! ├── keys.json
//! └── keys.json.tmp   (only while a write is in flight)
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use kwd_core::ApiKey;
use tokio::sync::RwLock as AsyncRwLock;

use crate::error::{ClientError, Result};

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Store a new row and return it with its assigned id.
    async fn insert(&self, key: ApiKey) -> Result<ApiKey>;

    /// Every row of `party`, valid or not, in insertion order.
    async fn keys(&self, party: &str) -> Result<Vec<ApiKey>>;

    /// Overwrite the row with the same id.
    async fn save(&self, key: &ApiKey) -> Result<()>;
}

fn poisoned(e: impl std::fmt::Display) -> ClientError {
    ClientError::IoError(std::io::Error::other(format!("Lock poisoned: {}", e)))
}

fn insert_row(rows: &mut Vec<ApiKey>, mut key: ApiKey) -> ApiKey {
    key.id = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    rows.push(key.clone());
    key
}

fn replace_row(rows: &mut [ApiKey], key: &ApiKey) -> Result<()> {
    let row = rows
        .iter_mut()
        .find(|r| r.id == key.id)
        .ok_or_else(|| ClientError::Store(format!("no key row with id {}", key.id)))?;
    *row = key.clone();
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKeyStore {
    rows: Arc<RwLock<Vec<ApiKey>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn insert(&self, key: ApiKey) -> Result<ApiKey> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        Ok(insert_row(&mut rows, key))
    }

    async fn keys(&self, party: &str) -> Result<Vec<ApiKey>> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.iter().filter(|r| r.party == party).cloned().collect())
    }

    async fn save(&self, key: &ApiKey) -> Result<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        replace_row(&mut rows, key)
    }
}

#[derive(Debug)]
pub struct JsonFileKeyStore {
    path: PathBuf,
    rows: AsyncRwLock<Vec<ApiKey>>,
}

impl JsonFileKeyStore {
    /// Open the store at `path`, loading existing rows if the file exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(ClientError::IoError)?;
            }
        }
        let rows = match fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ClientError::Store(format!("{} is not a key table: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(ClientError::IoError(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            rows: AsyncRwLock::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encode `rows` and hand the write to the blocking pool.
    async fn persist(&self, rows: &[ApiKey]) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(rows)
            .map_err(|e| ClientError::Store(format!("encode failed: {}", e)))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &encoded))
            .await
            .map_err(|e| ClientError::Store(format!("persist task failed: {}", e)))?
    }
}

/// Write to a temp file, fsync, and rename it over `path`.
fn write_atomically(path: &Path, encoded: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut temp_file = File::create(&temp_path).map_err(ClientError::IoError)?;
    temp_file.write_all(encoded).map_err(ClientError::IoError)?;
    temp_file.sync_all().map_err(ClientError::IoError)?;
    drop(temp_file);

    fs::rename(&temp_path, path).map_err(ClientError::IoError)?;
    Ok(())
}

#[async_trait]
impl KeyStore for JsonFileKeyStore {
    async fn insert(&self, key: ApiKey) -> Result<ApiKey> {
        let mut rows = self.rows.write().await;
        let mut next = rows.clone();
        let inserted = insert_row(&mut next, key);
        self.persist(&next).await?;
        *rows = next;
        Ok(inserted)
    }

    async fn keys(&self, party: &str) -> Result<Vec<ApiKey>> {
        let rows = self.rows.read().await;
        Ok(rows.iter().filter(|r| r.party == party).cloned().collect())
    }

    async fn save(&self, key: &ApiKey) -> Result<()> {
        let mut rows = self.rows.write().await;
        let mut next = rows.clone();
        replace_row(&mut next, key)?;
        self.persist(&next).await?;
        *rows = next;
        Ok(())
    }
}
