//! Consensus playbook binary.
//!
//! Print the scenario name or topology, or run every worker of the scenario
//! in one process:
//! ```bash
//! consensus_playbook local --home /tmp/playbook --timeout-secs 120
//! ```
//!
//! Local workers share the host network. Each gets its own `HOME`, but the
//! node ports come from the node's own configuration, so the role scripts
//! must give every node distinct P2P and RPC ports. `node.status_url` and
//! `node.p2p_port` describe the validator only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

use consensus_playbook::logging::{self, LogFormat};
use consensus_playbook::playbook::NAME;
use consensus_playbook::{ConsensusPlaybook, LocalRuntime, Playbook, ScenarioConfig, TopologyMode};

#[derive(Parser, Debug)]
#[command(name = "consensus_playbook")]
#[command(about = "Validator and full node bootstrap scenario")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: LevelFilter,

    #[arg(long, value_enum, default_value_t = LogFormat::Plaintext, global = true)]
    log_format: LogFormat,

    /// TOML file layered over the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the scenario name
    Name,

    /// Build the topology and print it as JSON
    Topology {
        /// Overrides `topology.mode` from the configuration
        #[arg(long)]
        mode: Option<TopologyMode>,
    },

    /// Run every worker in this process. The role scripts must assign each
    /// node its own ports, since all workers share the host network.
    Local {
        /// Directory holding one home per worker
        #[arg(long, default_value = ".playbook")]
        home: PathBuf,

        /// Stop all workers after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.log_level, args.log_format).context("Failed to initialise logging")?;

    let mut config =
        ScenarioConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Name => {
            println!("{NAME}");
            Ok(())
        }
        Command::Topology { mode } => {
            if let Some(mode) = mode {
                config.topology.mode = mode;
            }
            let mut playbook = ConsensusPlaybook::new(config);
            playbook.setup().context("Failed to build topology")?;
            let json = serde_json::to_string_pretty(playbook.node_sets())?;
            println!("{json}");
            Ok(())
        }
        Command::Local { home, timeout_secs } => {
            run_local(config, home, timeout_secs.map(Duration::from_secs)).await
        }
    }
}

async fn run_local(
    config: ScenarioConfig,
    home: PathBuf,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut playbook = ConsensusPlaybook::new(config);
    playbook.setup().context("Failed to build topology")?;
    let topology = playbook
        .topology()
        .cloned()
        .context("Topology missing after setup")?;

    let runtime = LocalRuntime::new(&home);
    let cancel = runtime.cancel_token();
    tokio::spawn(async move {
        match timeout {
            Some(limit) => tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping workers"),
                _ = tokio::time::sleep(limit) => {
                    warn!(?limit, "Time limit reached, stopping workers");
                }
            },
            None => match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, stopping workers"),
                Err(e) => {
                    warn!(error = %e, "Cannot listen for interrupts, workers run to completion");
                    return;
                }
            },
        }
        cancel.cancel();
    });

    info!(playbook = playbook.name(), home = %home.display(), "Running local scenario");
    let outcomes = runtime.run(Arc::new(playbook), &topology).await;

    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(&o.result, Err(e) if !e.is_cancelled()))
        .map(|o| o.uid.as_str())
        .collect();
    if !failed.is_empty() {
        bail!("{} worker(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
