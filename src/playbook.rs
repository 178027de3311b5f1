//! Scenario entry point: topology setup and per-worker role dispatch.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::ScenarioConfig;
use crate::error::Result;
use crate::fullnode::JoinCoordinator;
use crate::process::{NodeRunner, SystemRunner};
use crate::role::Role;
use crate::runtime::Worker;
use crate::topology::{NodeSet, Topology, TopologyBuilder};
use crate::validator::BootstrapCoordinator;

/// Scenario name registered with the orchestrator.
pub const NAME: &str = "testplan01";

/// What the orchestration framework needs from a scenario.
#[async_trait]
pub trait Playbook: Send + Sync {
    fn name(&self) -> &str;

    /// Builds the node sets. Must succeed before any worker runs.
    fn setup(&mut self) -> Result<()>;

    /// Empty until `setup` has succeeded.
    fn node_sets(&self) -> &[NodeSet];

    /// Runs inside one worker, for that worker's whole lifetime.
    async fn run_worker(&self, worker: &Worker) -> Result<()>;
}

pub struct ConsensusPlaybook {
    config: ScenarioConfig,
    runner: Arc<dyn NodeRunner>,
    topology: Option<Topology>,
}

impl ConsensusPlaybook {
    pub fn new(config: ScenarioConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    /// Drives scripts and the node binary through `runner` instead of real
    /// child processes.
    pub fn with_runner(config: ScenarioConfig, runner: Arc<dyn NodeRunner>) -> Self {
        Self {
            config,
            runner,
            topology: None,
        }
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }
}

#[async_trait]
impl Playbook for ConsensusPlaybook {
    fn name(&self) -> &str {
        NAME
    }

    fn setup(&mut self) -> Result<()> {
        let topology = TopologyBuilder::from_config(NAME, &self.config.topology).build()?;
        info!(
            playbook = NAME,
            mode = %self.config.topology.mode,
            node_sets = topology.node_sets.len(),
            workers = topology.workers().count(),
            "Built topology"
        );
        self.topology = Some(topology);
        Ok(())
    }

    fn node_sets(&self) -> &[NodeSet] {
        self.topology
            .as_ref()
            .map(|t| t.node_sets.as_slice())
            .unwrap_or_default()
    }

    async fn run_worker(&self, worker: &Worker) -> Result<()> {
        info!(playbook = NAME, uid = %worker.uid, "Running worker");
        run_role(worker, &self.config, self.runner.clone()).await
    }
}

/// Routes a worker to the coordinator of its role.
pub async fn run_role(
    worker: &Worker,
    config: &ScenarioConfig,
    runner: Arc<dyn NodeRunner>,
) -> Result<()> {
    match worker.env.role() {
        Some(Role::Validator) => BootstrapCoordinator::new(worker, config, runner).run().await,
        Some(Role::FullNode) => JoinCoordinator::new(worker, config, runner).run().await,
        None => {
            debug!(uid = %worker.uid, "No known role for worker, nothing to do");
            Ok(())
        }
    }
}

/// Awaits one coordinator phase, logging entry and failure.
pub(crate) async fn in_phase<P, T, F>(phase: P, step: F) -> Result<T>
where
    P: Display,
    F: Future<Output = Result<T>>,
{
    debug!(%phase, "Entering phase");
    step.await.map_err(|e| {
        if e.is_cancelled() {
            warn!(%phase, error = %e, "Phase cancelled");
        } else {
            error!(%phase, error = %e, "Phase failed");
        }
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyMode;

    #[test]
    fn setup_builds_node_sets_once() {
        let mut playbook = ConsensusPlaybook::new(ScenarioConfig::default());
        assert_eq!(playbook.name(), "testplan01");
        assert!(playbook.node_sets().is_empty());

        playbook.setup().unwrap();
        let sets = playbook.node_sets();
        assert_eq!(sets.len(), 1);
        assert!(sets[0].uid.starts_with("testplan01-consensus-"));
        assert_eq!(sets[0].workers.len(), 2);
    }

    #[test]
    fn split_setup_has_one_set_per_worker() {
        let mut config = ScenarioConfig::default();
        config.topology.mode = TopologyMode::Split;
        config.topology.full_nodes = 3;

        let mut playbook = ConsensusPlaybook::new(config);
        playbook.setup().unwrap();

        assert_eq!(playbook.node_sets().len(), 4);
        assert!(playbook.node_sets().iter().all(|s| s.workers.len() == 1));
    }
}
