//! CLI binary that simulates an HRM overlay in memory.
//!
//! Usage:
//!   hrm-node [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Path to configuration TOML file
//!   -n, --nodes <N>           Number of simulated nodes
//!   -t, --topology <KIND>     line, ring or star
//!   -d, --duration <SECS>     Simulation run time
//!   -s, --seed <SEED>         Seed for random priorities
//!   -v, --verbose             Increase logging verbosity
//!   --json                    JSON-formatted logs

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use hrm_node::config::{NodeConfig, Topology};
use hrm_node::Simulation;

/// HRM Node - simulate a hierarchical routing overlay.
#[derive(Parser, Debug)]
#[command(name = "hrm-node")]
#[command(about = "Simulates a hierarchical routing overlay of in-memory nodes")]
#[command(version)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of simulated nodes.
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Topology of the simulated links.
    #[arg(short, long, value_enum)]
    topology: Option<Topology>,

    /// Simulation run time in seconds.
    #[arg(short, long, value_name = "SECS")]
    duration: Option<u64>,

    /// Draw random priorities from this seed.
    #[arg(short, long)]
    seed: Option<u64>,

    /// Increase logging verbosity (can be repeated: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref())?;

    if let Some(nodes) = cli.nodes {
        config.simulation.nodes = nodes;
    }
    if let Some(topology) = cli.topology {
        config.simulation.topology = topology;
    }
    if let Some(duration) = cli.duration {
        config.simulation.duration_secs = duration;
    }
    if let Some(seed) = cli.seed {
        config.simulation.seed = Some(seed);
        config.simulation.random_priorities = true;
    }
    if cli.json {
        config.logging.json_format = true;
    }

    let log_level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if config.logging.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    tracing::info!(
        nodes = config.simulation.nodes,
        topology = ?config.simulation.topology,
        depth = config.hierarchy.depth,
        "Starting HRM simulation"
    );

    let simulation = Simulation::start(&config)?;
    let duration = Duration::from_secs(config.simulation.duration_secs);

    tokio::select! {
        result = simulation.wait_converged(duration) => match result {
            Ok(()) => tracing::info!(root = ?simulation.root().await, "Hierarchy converged"),
            Err(e) => tracing::warn!(error = %e, "Hierarchy not converged"),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    let report = simulation.report().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    simulation.shutdown().await;
    Ok(())
}
