use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kwd_client::{DEFAULT_LEASE_PREFIX, DEFAULT_STREAM_MAX_LEN, KeyPlacement, UpstreamConfig};
use kwd_core::{KeywardError, Result, StalenessPolicy};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutorConfig;
use crate::ingestion::IngestionConfig;
use crate::limiter::LimiterConfig;
use crate::monitor::MonitorConfig;
use crate::credential::PoolConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub staleness: StalenessSettings,
    #[serde(default)]
    pub lease: LeaseSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub ingestion: IngestionSettings,
    #[serde(default)]
    pub credentials: CredentialSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Replica identity for key affinity; looked up from the public address
    /// when unset.
    pub identity: Option<String>,
    /// Consumer name within the group; defaults to the host name.
    pub consumer: Option<String>,
    pub health_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub drain_timeout_secs: u64,
}

/// Shared Redis for the hint stream and lease counters. Without a URL both
/// stay in-process, which only suits a single replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub lease_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub name: String,
    pub group: String,
    /// Appends trim the stream to about this many entries.
    pub max_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessSettings {
    pub batch_stale_after_ms: u64,
    pub batch_stale_limit: usize,
    pub hint_max_age_ms: u64,
    pub low_priority_max_age_ms: u64,
    pub low_priority_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    pub permits: u32,
    pub queue_depth: u32,
    pub acquire_timeout_ms: u64,
    pub ttl_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub min_spacing_secs: u64,
    pub max_attempts: u32,
    pub upstream_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    pub batch_size: usize,
    pub read_timeout_ms: u64,
    pub poll_backoff_step_ms: u64,
    pub poll_backoff_max_ms: u64,
    pub batch_ceiling_secs: u64,
    pub error_backoff_min_ms: u64,
    pub error_backoff_max_ms: u64,
    pub restart_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    pub provider: String,
    pub staleness_window_secs: u64,
    pub usage_flush_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub revalidate_interval_secs: u64,
    pub key_retry_delay_ms: u64,
    pub invalid_key_delay_min_ms: u64,
    pub invalid_key_delay_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub key_placement: KeyPlacement,
    pub validate_path: String,
    pub subject_path: String,
    pub records_field: String,
    pub record_kind: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub topic_prefix: String,
    /// Directory for topic files; defaults to `data_dir/records`.
    pub dir: Option<PathBuf>,
    /// Kafka bootstrap servers; records go to topic files when unset.
    pub kafka_brokers: Option<String>,
    pub send_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            redis: RedisSettings::default(),
            stream: StreamSettings::default(),
            staleness: StalenessSettings::default(),
            lease: LeaseSettings::default(),
            executor: ExecutorSettings::default(),
            ingestion: IngestionSettings::default(),
            credentials: CredentialSettings::default(),
            monitor: MonitorSettings::default(),
            upstream: UpstreamSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            identity: None,
            consumer: None,
            health_addr: "0.0.0.0:8080"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080))),
            data_dir: PathBuf::from("./data"),
            drain_timeout_secs: 25,
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            lease_prefix: DEFAULT_LEASE_PREFIX.into(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            name: "ah-update".into(),
            group: "keyward-ah-update".into(),
            max_len: DEFAULT_STREAM_MAX_LEN,
        }
    }
}

impl Default for StalenessSettings {
    fn default() -> Self {
        let policy = StalenessPolicy::default();
        Self {
            batch_stale_after_ms: millis(policy.batch_stale_after),
            batch_stale_limit: policy.batch_stale_limit,
            hint_max_age_ms: millis(policy.hint_max_age),
            low_priority_max_age_ms: millis(policy.low_priority_max_age),
            low_priority_sources: policy.low_priority_sources,
        }
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            permits: 1,
            queue_depth: 1,
            acquire_timeout_ms: 30_000,
            ttl_secs: 120,
            poll_interval_ms: 250,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            min_spacing_secs: 40,
            max_attempts: 3,
            upstream_timeout_ms: 10_000,
        }
    }
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            batch_size: 4,
            read_timeout_ms: 2_000,
            poll_backoff_step_ms: 500,
            poll_backoff_max_ms: 10_000,
            batch_ceiling_secs: 60,
            error_backoff_min_ms: 5_000,
            error_backoff_max_ms: 15_000,
            restart_delay_ms: 1_000,
        }
    }
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            provider: kwd_core::DEFAULT_PROVIDER.into(),
            staleness_window_secs: 20 * 60,
            usage_flush_secs: 60,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            revalidate_interval_secs: 60 * 60,
            key_retry_delay_ms: 15_000,
            invalid_key_delay_min_ms: 1_000,
            invalid_key_delay_max_ms: 500_000,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        let upstream = UpstreamConfig::default();
        Self {
            base_url: upstream.base_url,
            key_placement: upstream.key_placement,
            validate_path: upstream.validate_path,
            subject_path: upstream.subject_path,
            records_field: upstream.records_field,
            record_kind: upstream.record_kind,
            request_timeout_ms: millis(upstream.request_timeout),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            topic_prefix: "sky-update-".into(),
            dir: None,
            kafka_brokers: None,
            send_timeout_ms: 5_000,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| KeywardError::Config(format!("TOML parse error: {}", e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| KeywardError::Config(format!("JSON parse error: {}", e))),
            _ => Err(KeywardError::Config(format!(
                "Unknown config file extension: {}",
                ext
            ))),
        }
    }

    pub fn from_args(args: &crate::cli::Args) -> Self {
        let mut config = Self::default();
        config.node.health_addr = args.health;
        config.node.data_dir = args.data_dir.clone();
        config.node.identity = args.identity.clone();
        config.node.consumer = args.consumer.clone();
        config.stream.name = args.stream.clone();
        config.stream.group = args.group.clone();
        config.credentials.provider = args.provider.clone();
        if let Some(base_url) = &args.upstream_url {
            config.upstream.base_url = base_url.clone();
        }
        config.redis.url = args.redis_url.clone();
        config.output.kafka_brokers = args.kafka_brokers.clone();
        config
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ingestion.batch_size == 0 {
            return Err(KeywardError::Config("ingestion.batch_size must be > 0".into()));
        }
        if self.lease.permits == 0 || self.lease.queue_depth == 0 {
            return Err(KeywardError::Config(
                "lease.permits and lease.queue_depth must be > 0".into(),
            ));
        }
        if self.executor.max_attempts == 0 {
            return Err(KeywardError::Config("executor.max_attempts must be > 0".into()));
        }
        if self.stream.name.is_empty() || self.stream.group.is_empty() {
            return Err(KeywardError::Config("stream.name and stream.group must be set".into()));
        }
        if self.credentials.provider.is_empty() {
            return Err(KeywardError::Config("credentials.provider must be set".into()));
        }
        if self.stream.max_len == 0 {
            return Err(KeywardError::Config("stream.max_len must be > 0".into()));
        }
        if self.output.kafka_brokers.is_some() && !cfg!(feature = "kafka") {
            return Err(KeywardError::Config(
                "output.kafka_brokers is set but keyward was built without the kafka feature"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn consumer_name(&self) -> String {
        self.node.consumer.clone().unwrap_or_else(|| {
            std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "keyward".to_string())
        })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.node.drain_timeout_secs)
    }

    pub fn staleness_policy(&self) -> StalenessPolicy {
        StalenessPolicy {
            batch_stale_after: Duration::from_millis(self.staleness.batch_stale_after_ms),
            batch_stale_limit: self.staleness.batch_stale_limit,
            hint_max_age: Duration::from_millis(self.staleness.hint_max_age_ms),
            low_priority_max_age: Duration::from_millis(self.staleness.low_priority_max_age_ms),
            low_priority_sources: self.staleness.low_priority_sources.clone(),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            staleness_window: Duration::from_secs(self.credentials.staleness_window_secs),
            usage_flush_interval: Duration::from_secs(self.credentials.usage_flush_secs),
        }
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            permits: self.lease.permits,
            queue_depth: self.lease.queue_depth,
            acquire_timeout: Duration::from_millis(self.lease.acquire_timeout_ms),
            ttl: Duration::from_secs(self.lease.ttl_secs),
            poll_interval: Duration::from_millis(self.lease.poll_interval_ms),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            provider: self.credentials.provider.clone(),
            min_spacing: Duration::from_secs(self.executor.min_spacing_secs),
            max_attempts: self.executor.max_attempts,
            upstream_timeout: Duration::from_millis(self.executor.upstream_timeout_ms),
            acquire_timeout: Duration::from_millis(self.lease.acquire_timeout_ms),
            topic_prefix: self.output.topic_prefix.clone(),
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            stream: self.stream.name.clone(),
            group: self.stream.group.clone(),
            consumer: self.consumer_name(),
            batch_size: self.ingestion.batch_size,
            read_timeout: Duration::from_millis(self.ingestion.read_timeout_ms),
            poll_backoff_step: Duration::from_millis(self.ingestion.poll_backoff_step_ms),
            poll_backoff_max: Duration::from_millis(self.ingestion.poll_backoff_max_ms),
            batch_ceiling: Duration::from_secs(self.ingestion.batch_ceiling_secs),
            error_backoff_min: Duration::from_millis(self.ingestion.error_backoff_min_ms),
            error_backoff_max: Duration::from_millis(self.ingestion.error_backoff_max_ms),
            restart_delay: Duration::from_millis(self.ingestion.restart_delay_ms),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            provider: self.credentials.provider.clone(),
            revalidate_interval: Duration::from_secs(self.monitor.revalidate_interval_secs),
            key_retry_delay: Duration::from_millis(self.monitor.key_retry_delay_ms),
            invalid_key_delay_min: Duration::from_millis(self.monitor.invalid_key_delay_min_ms),
            invalid_key_delay_max: Duration::from_millis(self.monitor.invalid_key_delay_max_ms),
        }
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream.base_url.clone(),
            key_placement: self.upstream.key_placement.clone(),
            validate_path: self.upstream.validate_path.clone(),
            subject_path: self.upstream.subject_path.clone(),
            records_field: self.upstream.records_field.clone(),
            record_kind: self.upstream.record_kind.clone(),
            request_timeout: Duration::from_millis(self.upstream.request_timeout_ms),
        }
    }

    pub fn key_store_path(&self) -> PathBuf {
        self.node.data_dir.join("keys.json")
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.output.send_timeout_ms)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output
            .dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("records"))
    }
}
