#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod error;
pub mod identity;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod key_store;
pub mod lease;
pub mod log;
pub mod redis_store;
pub mod stream;
pub mod upstream;

pub use error::{ClientError, Result};
pub use identity::{IdentityResolver, PublicIpIdentity, StaticIdentity};
#[cfg(feature = "kafka")]
pub use kafka::KafkaRecordLog;
pub use key_store::{JsonFileKeyStore, KeyStore, MemoryKeyStore};
pub use lease::{LeaseBackend, MemoryLeaseBackend};
pub use log::{FileRecordLog, LogLine, MemoryRecordLog, PublishedRecord, RecordLog};
pub use redis_store::{DEFAULT_LEASE_PREFIX, RedisHintStream, RedisLeaseBackend};
pub use stream::{DEFAULT_STREAM_MAX_LEN, HintStream, MemoryHintStream, enqueue_hint};
pub use upstream::{
    HttpUpstream, KeyPlacement, Scripted, ScriptedUpstream, UpstreamApi, UpstreamConfig,
    UpstreamRecord,
};
