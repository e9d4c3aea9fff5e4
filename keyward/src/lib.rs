#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod admin;
pub mod cli;
pub mod clock;
pub mod config;
pub mod credential;
pub mod executor;
pub mod health;
pub mod ingestion;
pub mod limiter;
pub mod metrics;
pub mod monitor;
pub mod service;
pub mod shutdown;

pub use clock::TimerClock;
pub use config::Config;
pub use health::{HealthState, Readiness};
pub use credential::{CredentialPool, PoolConfig};
pub use executor::{ExecutorConfig, Outcome, SkipReason, UpdateExecutor};
pub use ingestion::{IngestionConfig, IngestionLoop};
pub use limiter::{Lease, LimiterConfig, SubjectLeaseLimiter};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use monitor::{KeyHandle, KeyHealthMonitor, MonitorConfig};
pub use service::{Backends, Service};
