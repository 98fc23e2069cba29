//! Node binary

use clap::{Parser, Subcommand};
use ringkv::common::parse_duration;
use ringkv::{NodeConfig, NodeServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ringkv-node")]
#[command(about = "ringkv storage node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// TOML config file (RINGKV__* environment variables apply on top)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID: the base URL peers use to reach this node
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Cluster members, this node included (comma-separated)
        #[arg(long, value_delimiter = ',')]
        cluster: Vec<String>,

        /// MemTable flush threshold in bytes
        #[arg(long)]
        flush_threshold: Option<u64>,

        /// Replica request timeout (e.g. 500ms, 2s)
        #[arg(long)]
        replica_timeout: Option<String>,

        /// Log level when RUST_LOG is not set
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            data,
            cluster,
            flush_threshold,
            replica_timeout,
            log_level,
        } => {
            // Load config from file and environment, then override with CLI arguments
            let mut node_config = NodeConfig::load(config.as_deref())?;
            if let Some(id) = id {
                node_config.node_id = id;
            }
            if let Some(bind) = bind {
                node_config.bind_addr = bind;
            }
            if let Some(data) = data {
                node_config.storage.data_dir = data;
            }
            if !cluster.is_empty() {
                node_config.cluster = cluster;
            }
            if let Some(bytes) = flush_threshold {
                node_config.storage.flush_threshold_bytes = bytes;
            }
            if let Some(timeout) = replica_timeout {
                node_config.replication.replica_timeout_ms =
                    parse_duration(&timeout)?.as_millis() as u64;
            }
            if let Some(level) = log_level {
                node_config.log_level = level;
            }
            node_config.validate()?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| node_config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            NodeServer::new(node_config).serve().await?;
        }
    }

    Ok(())
}
