//! Scenario configuration.
//!
//! Built-in defaults reproduce the per-worker handshake variant: worker-scoped
//! exchange keys, a status check before height polling, and 10% packet loss
//! on full nodes. Every field can be overridden from a TOML file or from
//! environment variables using the `PLAYBOOK_` prefix, with nested fields
//! separated by a double underscore: `PLAYBOOK_POLLING__HEIGHT_INTERVAL_MS=500`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScenarioError};
use crate::exchange::KeyScope;
use crate::poll::PollPolicy;
use crate::role::Role;
use crate::topology::{TopologyMode, FULLNODE_SCRIPT_MOUNT, VALIDATOR_SCRIPT_MOUNT};

pub const ENV_PREFIX: &str = "PLAYBOOK_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub topology: TopologyConfig,
    pub exchange: ExchangeConfig,
    pub node: NodeConfig,
    pub polling: PollingConfig,
    pub fault_injection: FaultInjectionConfig,
    pub handshake: HandshakeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub mode: TopologyMode,
    pub full_nodes: usize,
    /// Static env injected into every worker on top of the role variables.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            mode: TopologyMode::Combined,
            full_nodes: 1,
            extra_env: BTreeMap::from([("KEY".to_string(), "VALUE".to_string())]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub key_scope: KeyScope,
}

/// How to drive the node binary inside a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub binary: String,
    /// Node home directory. Defaults to `$HOME/.celestia-app` of the worker.
    pub home: Option<PathBuf>,
    pub p2p_port: u16,
    pub status_url: String,
    pub log_level: String,
    pub validator_script: PathBuf,
    pub fullnode_script: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            binary: "celestia-appd".to_string(),
            home: None,
            p2p_port: 26656,
            status_url: "http://localhost:26657".to_string(),
            log_level: "error".to_string(),
            validator_script: PathBuf::from(VALIDATOR_SCRIPT_MOUNT.1),
            fullnode_script: PathBuf::from(FULLNODE_SCRIPT_MOUNT.1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub status_interval_ms: u64,
    pub height_interval_ms: u64,
    /// Attempt cap shared by every poll loop; unbounded when unset.
    pub max_attempts: Option<u32>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 2_000,
            height_interval_ms: 2_000,
            max_attempts: None,
        }
    }
}

impl PollingConfig {
    pub fn status_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.status_interval_ms),
            max_attempts: self.max_attempts,
        }
    }

    pub fn height_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.height_interval_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    pub target: Role,
    pub packet_loss_rate: u32,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: Role::FullNode,
            packet_loss_rate: 10,
        }
    }
}

impl FaultInjectionConfig {
    /// Packet loss the given role must apply, if any.
    pub fn loss_for(&self, role: Role) -> Option<u32> {
        (self.enabled && self.target == role).then_some(self.packet_loss_rate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Probe the status endpoint before polling chain height.
    pub health_check: bool,
    /// Resolve the validator's address before joining.
    pub locate_validator: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            health_check: true,
            locate_validator: true,
        }
    }
}

impl ScenarioConfig {
    /// The single-global-key variant: no status check, no fault injection.
    pub fn global_variant() -> Self {
        Self {
            exchange: ExchangeConfig {
                key_scope: KeyScope::Global,
            },
            fault_injection: FaultInjectionConfig {
                enabled: false,
                ..Default::default()
            },
            handshake: HandshakeConfig {
                health_check: false,
                locate_validator: false,
            },
            ..Default::default()
        }
    }

    /// Load defaults, then an optional TOML file, then `PLAYBOOK_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ScenarioConfig::default()));
        if let Some(path) = path {
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment = figment.merge(Toml::file(path)),
                other => {
                    return Err(ScenarioError::Setup(format!(
                        "unsupported config file format: {}",
                        other.unwrap_or("<none>")
                    )))
                }
            }
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: ScenarioConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.topology.full_nodes == 0 {
            return Err(ScenarioError::Setup(
                "topology.full_nodes must be at least 1".to_string(),
            ));
        }
        if self.polling.status_interval_ms == 0 || self.polling.height_interval_ms == 0 {
            return Err(ScenarioError::Setup(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        if self.fault_injection.packet_loss_rate > 100 {
            return Err(ScenarioError::Setup(format!(
                "packet loss rate {} is not a percentage",
                self.fault_injection.packet_loss_rate
            )));
        }
        Ok(())
    }
}
