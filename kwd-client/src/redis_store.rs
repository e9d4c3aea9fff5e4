//! Redis-backed hint stream and lease counters.
//!
//! Replicas share one Redis: the hint stream is a Redis stream read through a
//! consumer group, and lease counters are plain keys updated by Lua scripts
//! so the check and the increment happen atomically for every replica.
//!
//! ```text
//! {stream}                       XADD / XREADGROUP / XACK
//! {key_prefix}{counter}          lease counter, PEXPIRE ttl
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kwd_core::RawEntry;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Script};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::lease::LeaseBackend;
use crate::stream::HintStream;

/// Default prefix for lease counter keys.
pub const DEFAULT_LEASE_PREFIX: &str = "keyward:lease:";

const TRY_INCREMENT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return 0
end
redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
";

const DECREMENT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
    redis.call('DEL', KEYS[1])
    return 0
end
return redis.call('DECR', KEYS[1])
";

impl From<RedisError> for ClientError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(format!("redis: {}", err))
        }
    }
}

async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Flatten one stream entry into a [`RawEntry`]; non-string values are dropped.
fn to_raw_entry(entry: StreamId) -> RawEntry {
    let fields: BTreeMap<String, String> = entry
        .map
        .iter()
        .filter_map(|(field, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (field.clone(), v))
        })
        .collect();
    RawEntry::new(entry.id, fields)
}

/// Consumer-group conditions Redis reports through the error code.
fn group_condition(code: Option<&str>, stream: &str, group: &str) -> Option<ClientError> {
    match code {
        Some("NOGROUP") => Some(ClientError::GroupMissing {
            stream: stream.to_string(),
            group: group.to_string(),
        }),
        Some("BUSYGROUP") => Some(ClientError::GroupExists {
            stream: stream.to_string(),
            group: group.to_string(),
        }),
        _ => None,
    }
}

fn group_error(err: RedisError, stream: &str, group: &str) -> ClientError {
    group_condition(err.code(), stream, group).unwrap_or_else(|| err.into())
}

/// Consumer-group reads over a Redis stream.
///
/// Blocking reads hold their connection for the whole block, so they get a
/// connection of their own.
pub struct RedisHintStream {
    reader: ConnectionManager,
    writer: ConnectionManager,
    max_len: usize,
}

impl RedisHintStream {
    /// Connect to `url`; appends trim the stream to roughly `max_len` entries.
    pub async fn connect(url: &str, max_len: usize) -> Result<Self> {
        let reader = connect(url).await?;
        let writer = connect(url).await?;
        info!(target: "keyward::redis", max_len, "Hint stream connected");
        Ok(Self {
            reader,
            writer,
            max_len,
        })
    }
}

#[async_trait]
impl HintStream for RedisHintStream {
    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.writer.clone();
        let _: () = conn
            .xgroup_create_mkstream(stream, group, "$")
            .await
            .map_err(|e| group_error(e, stream, group))?;
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
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX).max(1);
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|e| group_error(e, stream, group))?;

        let entries: Vec<RawEntry> = reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .map(to_raw_entry)
            .collect();
        if !entries.is_empty() {
            debug!(target: "keyward::redis", stream, count = entries.len(), "Read entries");
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.writer.clone();
        conn.xack(stream, group, ids)
            .await
            .map_err(|e| group_error(e, stream, group))
    }

    async fn add(&self, stream: &str, fields: BTreeMap<String, String>) -> Result<String> {
        let items: Vec<(String, String)> = fields.into_iter().collect();
        let mut conn = self.writer.clone();
        Ok(conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(self.max_len), "*", &items)
            .await?)
    }
}

/// Lease counters shared by every replica pointed at the same Redis.
pub struct RedisLeaseBackend {
    conn: ConnectionManager,
    key_prefix: String,
    try_increment: Script,
    decrement: Script,
}

impl RedisLeaseBackend {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let conn = connect(url).await?;
        let key_prefix = key_prefix.into();
        info!(target: "keyward::redis", prefix = %key_prefix, "Lease backend connected");
        Ok(Self {
            conn,
            key_prefix,
            try_increment: Script::new(TRY_INCREMENT),
            decrement: Script::new(DECREMENT),
        })
    }

    fn key(&self, counter: &str) -> String {
        format!("{}{}", self.key_prefix, counter)
    }
}

#[async_trait]
impl LeaseBackend for RedisLeaseBackend {
    async fn try_increment(&self, counter: &str, limit: u32, ttl: Duration) -> Result<bool> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();
        let taken: i64 = self
            .try_increment
            .key(self.key(counter))
            .arg(limit)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    async fn decrement(&self, counter: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .decrement
            .key(self.key(counter))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn value(&self, counter: &str) -> Result<u32> {
        let mut conn = self.conn.clone();
        let value: Option<u32> = conn.get(self.key(counter)).await?;
        Ok(value.unwrap_or(0))
    }
}
