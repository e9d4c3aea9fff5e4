#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keyward::cli::Args;
use keyward::{Backends, Config, Service, health, shutdown};
use kwd_client::{
    FileRecordLog, HintStream, HttpUpstream, IdentityResolver, JsonFileKeyStore, LeaseBackend,
    MemoryHintStream, MemoryLeaseBackend, PublicIpIdentity, RecordLog, RedisHintStream,
    RedisLeaseBackend, StaticIdentity,
};
use kwd_core::{KeywardError, SystemClock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const IDENTITY_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    target: "keyward",
                    error = %e,
                    path = %path.display(),
                    "Failed to load config file"
                );
                std::process::exit(1);
            },
        },
        None => Config::from_args(&args),
    };
    if let Err(e) = config.validate() {
        error!(target: "keyward", error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    info!(
        target: "keyward",
        health = %config.node.health_addr,
        data_dir = %config.node.data_dir.display(),
        stream = %config.stream.name,
        group = %config.stream.group,
        provider = %config.credentials.provider,
        "Starting keyward"
    );

    if let Err(e) = std::fs::create_dir_all(&config.node.data_dir) {
        error!(target: "keyward", error = %e, "Failed to create data directory");
        std::process::exit(1);
    }

    let backends = match build_backends(&config).await {
        Ok(b) => b,
        Err(e) => {
            error!(target: "keyward", error = %e, "Failed to initialize backends");
            std::process::exit(1);
        },
    };
    let service = Arc::new(Service::new(&config, backends));

    let cancel = CancellationToken::new();
    let shutdown_signal = match shutdown::install_signal_handlers(cancel.clone()) {
        Ok(signal) => signal,
        Err(e) => {
            error!(target: "keyward", error = %e, "Failed to install signal handlers");
            std::process::exit(1);
        },
    };

    let health_handle = tokio::spawn(health::run_health_server(
        config.node.health_addr,
        Arc::clone(service.health()),
        Some(service.admin_context()),
        cancel.clone(),
    ));

    let service_handle = {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };

    tokio::select! {
        _ = shutdown_signal => {
            info!(target: "keyward", "Shutdown signal received");
        }
        result = health_handle => {
            match result {
                Ok(Ok(())) => info!(target: "keyward", "Health server exited"),
                Ok(Err(e)) => error!(target: "keyward", error = %e, "Health server error"),
                Err(e) => error!(target: "keyward", error = %e, "Health server task panicked"),
            }
            cancel.cancel();
        }
    }

    if let Err(e) = service_handle.await {
        error!(target: "keyward", error = %e, "Service task panicked");
    }

    if service.shutdown(config.drain_timeout()).await {
        info!(target: "keyward", "Graceful drain complete");
    } else {
        warn!(target: "keyward", "Drain timed out, some hints may be incomplete");
    }

    info!(
        target: "keyward",
        stats = ?service.metrics().snapshot(),
        "keyward shutdown complete"
    );
}

async fn build_backends(config: &Config) -> Result<Backends, KeywardError> {
    let identity: Arc<dyn IdentityResolver> = match &config.node.identity {
        Some(identity) => Arc::new(StaticIdentity::new(identity.clone())),
        None => Arc::new(PublicIpIdentity::new(IDENTITY_LOOKUP_TIMEOUT)?),
    };

    let (stream, leases): (Arc<dyn HintStream>, Arc<dyn LeaseBackend>) = match &config.redis.url {
        Some(url) => {
            info!(target: "keyward", "Using Redis for the hint stream and leases");
            (
                Arc::new(RedisHintStream::connect(url, config.stream.max_len).await?),
                Arc::new(RedisLeaseBackend::connect(url, config.redis.lease_prefix.clone()).await?),
            )
        },
        None => {
            warn!(
                target: "keyward",
                "No redis.url configured; hint stream and leases are local to this replica"
            );
            (
                Arc::new(MemoryHintStream::with_max_len(config.stream.max_len)),
                Arc::new(MemoryLeaseBackend::new()),
            )
        },
    };

    Ok(Backends {
        stream,
        log: build_record_log(config)?,
        keys: Arc::new(JsonFileKeyStore::open(&config.key_store_path())?),
        upstream: Arc::new(HttpUpstream::new(config.upstream_config())?),
        leases,
        identity,
        clock: Arc::new(SystemClock),
    })
}

#[cfg(feature = "kafka")]
fn build_record_log(config: &Config) -> Result<Arc<dyn RecordLog>, KeywardError> {
    match &config.output.kafka_brokers {
        Some(brokers) => Ok(Arc::new(kwd_client::KafkaRecordLog::connect(
            brokers,
            config.send_timeout(),
        )?)),
        None => Ok(Arc::new(FileRecordLog::open(&config.output_dir())?)),
    }
}

#[cfg(not(feature = "kafka"))]
fn build_record_log(config: &Config) -> Result<Arc<dyn RecordLog>, KeywardError> {
    Ok(Arc::new(FileRecordLog::open(&config.output_dir())?))
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,keyward=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let rendered = toml::to_string_pretty(&Config::default())
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let content = format!(
        "# keyward configuration\n\
         # Generated by: keyward --gen-config {}\n\
         #\n\
         # All values shown are defaults. Durations are in the unit their key names.\n\n\
         {}",
        path.display(),
        rendered
    );
    std::fs::write(path, content)
}
