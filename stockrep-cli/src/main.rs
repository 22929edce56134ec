//! stockrep - console for a replicated stock quote node.

mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use stockrep_cluster::observability::{
    TracingConfig, TracingConfigBuilder, TracingGuard, init_tracing,
};
use stockrep_cluster::{ClusterConfig, NodeId, ReplicaNode};

const DEFAULT_PROPS: &str = "config.toml";

/// Replicated stock quote server.
#[derive(Parser)]
#[command(name = "stockrep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the TOML cluster configuration [default: config.toml]
    #[arg(short, long)]
    props: Option<PathBuf>,

    /// Override the node ID from the configuration
    #[arg(long)]
    node_id: Option<NodeId>,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<String>,

    /// Serve without the interactive menu until Ctrl+C
    #[arg(long)]
    headless: bool,
}

fn setup_logging(verbosity: u8) -> Result<TracingGuard> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // STOCKREP_LOG_LEVEL or RUST_LOG win over the verbosity flag.
    let config = TracingConfigBuilder::from_config(TracingConfig::from_env(filter))
        .use_stderr(true)
        .build();

    init_tracing(config)
}

fn load_config(cli: &Cli) -> Result<ClusterConfig> {
    let mut config = match &cli.props {
        Some(path) => ClusterConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None if std::path::Path::new(DEFAULT_PROPS).exists() => {
            ClusterConfig::from_file(DEFAULT_PROPS)
                .with_context(|| format!("Failed to load {}", DEFAULT_PROPS))?
        }
        None => {
            tracing::warn!("{} not found, using defaults", DEFAULT_PROPS);
            ClusterConfig::default()
        }
    };

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }

    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing_guard = setup_logging(cli.verbose)?;

    let config = load_config(&cli)?;
    tracing::info!(
        node_id = config.node_id,
        cluster = %config.cluster_name,
        listen = %config.listen_addr,
        peers = config.peers.len(),
        "starting replica node"
    );

    let node = ReplicaNode::start(config)
        .await
        .context("Failed to join the replica group")?;

    if cli.headless {
        commands::headless::run(node).await
    } else {
        commands::menu::run(node).await
    }
}
