//! Full node side of the handshake.
//!
//! ```text
//! RESOLVE -> LOCATE -> LOCAL_PREP -> AWAIT_GENESIS -> AWAIT_PEER -> START
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{info, info_span, Instrument};

use crate::config::ScenarioConfig;
use crate::error::Result;
use crate::exchange::{ExchangeKeys, Handshake, PeerDescriptor};
use crate::genesis::{genesis_path, node_home, write_genesis};
use crate::playbook::in_phase;
use crate::process::{run_script, NodeCli, NodeRunner};
use crate::role::{Role, ENV_VALIDATOR_UID};
use crate::runtime::{with_packet_loss, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinPhase {
    Resolve,
    Locate,
    LocalPrep,
    AwaitGenesis,
    AwaitPeer,
    Start,
}

impl fmt::Display for JoinPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinPhase::Resolve => "resolve",
            JoinPhase::Locate => "locate",
            JoinPhase::LocalPrep => "local_prep",
            JoinPhase::AwaitGenesis => "await_genesis",
            JoinPhase::AwaitPeer => "await_peer",
            JoinPhase::Start => "start",
        })
    }
}

pub struct JoinCoordinator<'a> {
    worker: &'a Worker,
    config: &'a ScenarioConfig,
    runner: Arc<dyn NodeRunner>,
}

impl<'a> JoinCoordinator<'a> {
    pub fn new(
        worker: &'a Worker,
        config: &'a ScenarioConfig,
        runner: Arc<dyn NodeRunner>,
    ) -> Self {
        Self {
            worker,
            config,
            runner,
        }
    }

    /// Returns once the node process exits; its failure is the result.
    pub async fn run(&self) -> Result<()> {
        let span = info_span!("full_node", uid = %self.worker.uid);
        async {
            info!("Joining network");

            // No exchange or fault call may happen before this succeeds.
            let validator_uid = in_phase(JoinPhase::Resolve, async {
                self.worker.env.require(ENV_VALIDATOR_UID).map(str::to_string)
            })
            .await?;
            info!(%validator_uid, "Resolved validator");

            if self.config.handshake.locate_validator {
                in_phase(JoinPhase::Locate, self.locate(&validator_uid)).await?;
            }

            let loss = self.config.fault_injection.loss_for(Role::FullNode);
            with_packet_loss(self.worker.faults.as_ref(), loss, self.join(&validator_uid)).await
        }
        .instrument(span)
        .await
    }

    async fn locate(&self, validator_uid: &str) -> Result<()> {
        let ip = self
            .worker
            .message
            .ip_waiting(validator_uid, &self.worker.cancel)
            .await?;
        info!(%validator_uid, %ip, "Located validator");
        Ok(())
    }

    async fn join(&self, validator_uid: &str) -> Result<()> {
        let cli = NodeCli::new(&self.config.node, &self.worker.env);
        let handshake = Handshake::new(
            self.worker.message.as_ref(),
            ExchangeKeys::new(self.config.exchange.key_scope),
        );

        in_phase(JoinPhase::LocalPrep, async {
            run_script(self.runner.as_ref(), &cli.script(&self.config.node.fullnode_script)).await?;
            Ok(())
        })
        .await?;
        in_phase(JoinPhase::AwaitGenesis, self.fetch_genesis(&handshake, validator_uid)).await?;
        let seed =
            in_phase(JoinPhase::AwaitPeer, self.await_peer(&handshake, validator_uid)).await?;
        in_phase(JoinPhase::Start, async {
            let cmd = cli.start_with_seed(&seed);
            info!(command = %cmd, "Starting node");
            self.runner.run(&cmd, &self.worker.cancel).await
        })
        .await
    }

    async fn fetch_genesis(&self, handshake: &Handshake<'_>, validator_uid: &str) -> Result<()> {
        let id = handshake
            .read_genesis_id(validator_uid, &self.worker.cancel)
            .await?;
        let bytes = self.worker.blobs.pull(&id).await?;

        let path = genesis_path(&node_home(&self.config.node, &self.worker.env)?);
        write_genesis(&path, &bytes).await?;
        info!(content_id = %id, path = %path.display(), size = bytes.len(), "Fetched genesis file");
        Ok(())
    }

    async fn await_peer(
        &self,
        handshake: &Handshake<'_>,
        validator_uid: &str,
    ) -> Result<PeerDescriptor> {
        let seed = handshake.read_peer(validator_uid, &self.worker.cancel).await?;
        info!(%seed, "Received validator seed");
        Ok(seed)
    }
}
