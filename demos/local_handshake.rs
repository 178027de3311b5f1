// demos/local_handshake.rs
//
// Runs the full handshake in-process with scripted node commands, so no
// node binary is needed. Run with `cargo run --example local_handshake`.
use std::path::Path;
use std::sync::Arc;

use consensus_playbook::genesis::{genesis_path, NODE_HOME_DIR};
use consensus_playbook::logging::{self, LogFormat};
use consensus_playbook::process::{CommandOutput, NodeCommand, ScriptedRunner};
use consensus_playbook::role::ENV_HOME;
use consensus_playbook::*;
use tokio::time::{sleep, Duration};
use tracing::level_filters::LevelFilter;

const SEEDED_START: &str = "celestia-appd start --p2p.seeds 2f1c9a0de6b4@10.0.0.2:26656";

fn init_validator(cmd: &NodeCommand) -> Result<CommandOutput> {
    let home = cmd
        .get_env(ENV_HOME)
        .ok_or_else(|| ScenarioError::Env(ENV_HOME.to_string()))?;
    let path = genesis_path(&Path::new(home).join(NODE_HOME_DIR));
    let dir = path.parent().unwrap_or(Path::new(home));
    std::fs::create_dir_all(dir).map_err(|e| ScenarioError::io("create directory", dir, e))?;
    std::fs::write(&path, br#"{"chain_id":"local-demo","initial_height":"1"}"#)
        .map_err(|e| ScenarioError::io("write", &path, e))?;
    Ok(CommandOutput::success("genesis written\n"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(LevelFilter::INFO, LogFormat::Plaintext)?;

    println!("Consensus handshake: 1 validator, 2 full nodes");
    println!("==============================================");

    let runner = ScriptedRunner::new()
        .handle("sh /opt/validator.sh", init_validator)
        .serve("celestia-appd start --log_level error")
        .reply(
            "celestia-appd query block",
            [
                CommandOutput::success("null\n"),
                CommandOutput::exit(1, "no block yet\n"),
                CommandOutput::success("1\n"),
            ],
        )
        .reply(
            "celestia-appd tendermint show-node-id",
            [CommandOutput::success("2f1c9a0de6b4\n")],
        );

    let mut config = ScenarioConfig::default();
    config.topology.full_nodes = 2;
    config.handshake.health_check = false;
    config.polling.height_interval_ms = 200;

    let mut playbook = ConsensusPlaybook::with_runner(config, Arc::new(runner.clone()));
    playbook.setup()?;
    let topology = playbook
        .topology()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("topology missing after setup"))?;

    let home = tempfile::tempdir()?;
    let runtime = LocalRuntime::new(home.path());

    let cancel = runtime.cancel_token();
    let watcher = runner.clone();
    tokio::spawn(async move {
        while watcher.count(SEEDED_START) < 2 {
            sleep(Duration::from_millis(50)).await;
        }
        cancel.cancel();
    });

    for outcome in runtime.run(Arc::new(playbook), &topology).await {
        match outcome.result {
            Ok(()) => println!("  {} ({}) joined", outcome.uid, outcome.role),
            Err(e) if e.is_cancelled() => println!("  {} ({}) stopped", outcome.uid, outcome.role),
            Err(e) => println!("  {} ({}) failed: {e}", outcome.uid, outcome.role),
        }
    }

    println!("\nCommands issued:");
    for cmd in runner.calls() {
        println!("  {cmd}");
    }
    Ok(())
}
