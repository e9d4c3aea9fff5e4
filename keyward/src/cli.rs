use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "keyward")]
#[command(about = "keyward - pooled-credential refresh pipeline")]
#[command(version)]
pub struct Args {
    /// Health and admin HTTP address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub health: SocketAddr,

    #[arg(short, long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Replica identity for key affinity (defaults to the public address)
    #[arg(long)]
    pub identity: Option<String>,

    /// Consumer name within the group (defaults to $HOSTNAME)
    #[arg(long)]
    pub consumer: Option<String>,

    #[arg(long, default_value = "ah-update")]
    pub stream: String,

    #[arg(long, default_value = "keyward-ah-update")]
    pub group: String,

    /// Key party to draw credentials from
    #[arg(long, default_value = kwd_core::DEFAULT_PROVIDER)]
    pub provider: String,

    #[arg(long)]
    pub upstream_url: Option<String>,

    /// Redis shared by replicas for the hint stream and leases
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Kafka bootstrap servers for the record log (needs the kafka feature)
    #[arg(long)]
    pub kafka_brokers: Option<String>,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub gen_config: Option<PathBuf>,
}
