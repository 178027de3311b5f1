//! Validator side of the handshake.
//!
//! ```text
//! INIT -> PUBLISH_GENESIS -> START -> AWAIT_HEALTHY -> PUBLISH_PEER -> IDLE
//! ```
//!
//! The genesis id is published only after the blob push returned, and the
//! seed only after the chain reached height 1. Full nodes rely on both.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::ScenarioConfig;
use crate::error::{Result, ScenarioError};
use crate::exchange::{ExchangeKeys, Handshake, PeerDescriptor};
use crate::genesis::{genesis_path, node_home, read_genesis};
use crate::health::{wait_for_first_block, wait_for_server_ready};
use crate::playbook::in_phase;
use crate::process::{run_script, NodeCli, NodeRunner};
use crate::role::Role;
use crate::runtime::{with_packet_loss, ContentId, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    Init,
    PublishGenesis,
    Start,
    AwaitHealthy,
    PublishPeer,
    Idle,
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootstrapPhase::Init => "init",
            BootstrapPhase::PublishGenesis => "publish_genesis",
            BootstrapPhase::Start => "start",
            BootstrapPhase::AwaitHealthy => "await_healthy",
            BootstrapPhase::PublishPeer => "publish_peer",
            BootstrapPhase::Idle => "idle",
        })
    }
}

pub struct BootstrapCoordinator<'a> {
    worker: &'a Worker,
    config: &'a ScenarioConfig,
    runner: Arc<dyn NodeRunner>,
}

impl<'a> BootstrapCoordinator<'a> {
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

    /// Runs until the worker is cancelled or a phase fails. Never returns
    /// `Ok`: a healthy validator idles until cancellation.
    pub async fn run(&self) -> Result<()> {
        let span = info_span!("validator", uid = %self.worker.uid);
        async {
            info!("Bootstrapping validator");
            let loss = self.config.fault_injection.loss_for(Role::Validator);
            with_packet_loss(self.worker.faults.as_ref(), loss, self.bootstrap()).await
        }
        .instrument(span)
        .await
    }

    async fn bootstrap(&self) -> Result<()> {
        let cli = NodeCli::new(&self.config.node, &self.worker.env);
        let handshake = Handshake::new(
            self.worker.message.as_ref(),
            ExchangeKeys::new(self.config.exchange.key_scope),
        );

        in_phase(BootstrapPhase::Init, self.init(&cli)).await?;
        in_phase(BootstrapPhase::PublishGenesis, self.publish_genesis(&handshake)).await?;

        // The node lives until this coordinator returns, however it returns.
        let node_cancel = self.worker.cancel.child_token();
        let _stop_node = node_cancel.clone().drop_guard();
        let mut node = in_phase(BootstrapPhase::Start, async {
            Ok(self.start(&cli, node_cancel))
        })
        .await?;

        in_phase(BootstrapPhase::AwaitHealthy, self.await_healthy(&cli, &mut node)).await?;
        in_phase(BootstrapPhase::PublishPeer, self.publish_peer(&cli, &handshake)).await?;
        in_phase(BootstrapPhase::Idle, self.idle()).await
    }

    async fn init(&self, cli: &NodeCli<'_>) -> Result<()> {
        run_script(self.runner.as_ref(), &cli.script(&self.config.node.validator_script)).await?;
        Ok(())
    }

    async fn publish_genesis(&self, handshake: &Handshake<'_>) -> Result<ContentId> {
        let path = genesis_path(&node_home(&self.config.node, &self.worker.env)?);
        let bytes = read_genesis(&path).await?;
        let size = bytes.len();

        let id = self.worker.blobs.push(bytes).await?;
        info!(path = %path.display(), size, content_id = %id, "Pushed genesis file");

        handshake.publish_genesis_id(&self.worker.uid, &id).await?;
        Ok(id)
    }

    /// The task resolves to the reason the node stopped.
    fn start(&self, cli: &NodeCli<'_>, cancel: CancellationToken) -> JoinHandle<ScenarioError> {
        let cmd = cli.start();
        let runner = self.runner.clone();
        info!(command = %cmd, "Starting node in the background");

        tokio::spawn(
            async move {
                match runner.run(&cmd, &cancel).await {
                    Ok(()) => {
                        warn!(command = %cmd, "Node exited");
                        ScenarioError::Process {
                            command: cmd.line(),
                            status: "exit code 0".to_string(),
                            output: "node exited before the run ended".to_string(),
                        }
                    }
                    Err(e) if e.is_cancelled() => {
                        debug!(command = %cmd, "Node stopped");
                        e
                    }
                    Err(e) => {
                        error!(command = %cmd, error = %e, "Node failed");
                        e
                    }
                }
            }
            .instrument(Span::current()),
        )
    }

    /// Fails as soon as the background node stops, whatever the probes see.
    async fn await_healthy(
        &self,
        cli: &NodeCli<'_>,
        node: &mut JoinHandle<ScenarioError>,
    ) -> Result<u64> {
        tokio::select! {
            height = self.probe_health(cli) => height,
            stopped = node => Err(match stopped {
                Ok(reason) => reason,
                Err(e) => ScenarioError::Setup(format!("node task failed: {e}")),
            }),
        }
    }

    async fn probe_health(&self, cli: &NodeCli<'_>) -> Result<u64> {
        if self.config.handshake.health_check {
            wait_for_server_ready(
                &self.config.node.status_url,
                self.config.polling.status_policy(),
                &self.worker.cancel,
            )
            .await?;
        }
        wait_for_first_block(
            self.runner.as_ref(),
            &cli.query_block(),
            self.config.polling.height_policy(),
            &self.worker.cancel,
        )
        .await
    }

    async fn publish_peer(
        &self,
        cli: &NodeCli<'_>,
        handshake: &Handshake<'_>,
    ) -> Result<PeerDescriptor> {
        let cmd = cli.show_node_id();
        let out = self.runner.output(&cmd).await?.check(&cmd)?;
        let node_id = out.text().trim().to_string();
        if node_id.is_empty() {
            return Err(ScenarioError::Process {
                command: cmd.line(),
                status: out.status(),
                output: "empty node id".to_string(),
            });
        }

        let peer = PeerDescriptor::new(node_id, self.worker.local_ip, self.config.node.p2p_port);
        handshake.publish_peer(&self.worker.uid, &peer).await?;
        Ok(peer)
    }

    async fn idle(&self) -> Result<()> {
        info!("Handshake published, serving until the run ends");
        self.worker.cancel.cancelled().await;
        Err(ScenarioError::Cancelled("serving as validator".to_string()))
    }
}
