//! Worker grouping and identity generation.
//!
//! Identities are generated here exactly once and threaded into every
//! worker's env, so a full node learns its validator from `VALIDATOR_UID`
//! rather than from shared process state.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::TopologyConfig;
use crate::error::{Result, ScenarioError};
use crate::role::{Role, WorkerEnv, ENV_NODE_TYPE, ENV_VALIDATOR_UID};

pub type WorkerUid = String;

/// Host-side script and its mount point inside the validator container.
pub const VALIDATOR_SCRIPT_MOUNT: (&str, &str) = ("./resources/validator.sh", "/opt/validator.sh");
/// Host-side script and its mount point inside a full-node container.
pub const FULLNODE_SCRIPT_MOUNT: (&str, &str) = ("./resources/fullnode.sh", "/opt/fullnode.sh");

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 8;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologyMode {
    /// Both roles share one group (and network namespace).
    #[default]
    Combined,
    /// One group per worker, so per-worker fault injection and ports never collide.
    Split,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyMode::Combined => f.write_str("combined"),
            TopologyMode::Split => f.write_str("split"),
        }
    }
}

impl FromStr for TopologyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(TopologyMode::Combined),
            "split" => Ok(TopologyMode::Split),
            other => Err(format!("unknown topology mode `{other}` (expected combined or split)")),
        }
    }
}

/// Declaration of one worker: identity, injected env and file mounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub uid: WorkerUid,
    pub role: Role,
    pub envs: BTreeMap<String, String>,
    /// Host path -> container path.
    pub files: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn env(&self) -> WorkerEnv {
        WorkerEnv::new(self.envs.clone())
    }
}

/// A group of workers scheduled together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    pub uid: String,
    pub workers: Vec<WorkerSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub node_sets: Vec<NodeSet>,
}

impl Topology {
    pub fn workers(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.node_sets.iter().flat_map(|set| set.workers.iter())
    }

    pub fn validator(&self) -> Option<&WorkerSpec> {
        self.workers().find(|w| w.role == Role::Validator)
    }

    pub fn full_nodes(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.workers().filter(|w| w.role == Role::FullNode)
    }

    fn ensure_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let ids = self
            .node_sets
            .iter()
            .map(|set| &set.uid)
            .chain(self.workers().map(|w| &w.uid));
        for id in ids {
            if !seen.insert(id) {
                return Err(ScenarioError::Setup(format!(
                    "identifier `{id}` was generated twice"
                )));
            }
        }
        Ok(())
    }
}

pub struct TopologyBuilder {
    name: String,
    mode: TopologyMode,
    full_nodes: usize,
    extra_env: BTreeMap<String, String>,
}

impl TopologyBuilder {
    pub fn new(name: impl Into<String>, mode: TopologyMode) -> Self {
        Self {
            name: name.into(),
            mode,
            full_nodes: 1,
            extra_env: BTreeMap::new(),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &TopologyConfig) -> Self {
        Self {
            name: name.into(),
            mode: config.mode,
            full_nodes: config.full_nodes,
            extra_env: config.extra_env.clone(),
        }
    }

    pub fn full_nodes(mut self, count: usize) -> Self {
        self.full_nodes = count;
        self
    }

    pub fn extra_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Builds the complete topology or nothing at all.
    pub fn build(&self) -> Result<Topology> {
        if !is_dns1123_subdomain(&self.name) {
            return Err(ScenarioError::Setup(format!(
                "scenario name `{}` is not a valid DNS-1123 subdomain",
                self.name
            )));
        }
        if self.full_nodes == 0 {
            return Err(ScenarioError::Setup(
                "topology needs at least one full node".to_string(),
            ));
        }

        let validator = self.worker(Role::Validator, None)?;
        let mut workers = Vec::with_capacity(self.full_nodes + 1);
        for _ in 0..self.full_nodes {
            workers.push(self.worker(Role::FullNode, Some(&validator.uid))?);
        }
        workers.insert(0, validator);

        let node_sets = match self.mode {
            TopologyMode::Combined => vec![NodeSet {
                uid: new_random_name(&format!("{}-consensus", self.name))?,
                workers,
            }],
            TopologyMode::Split => workers
                .into_iter()
                .map(|worker| {
                    Ok(NodeSet {
                        uid: new_random_name(&format!("{}-{}", self.name, worker.role))?,
                        workers: vec![worker],
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let topology = Topology { node_sets };
        topology.ensure_unique()?;
        Ok(topology)
    }

    fn worker(&self, role: Role, validator_uid: Option<&str>) -> Result<WorkerSpec> {
        let uid = new_random_name(role.uid_prefix())?;

        let mut envs = self.extra_env.clone();
        envs.insert(ENV_NODE_TYPE.to_string(), role.as_env_value().to_string());
        if let Some(validator_uid) = validator_uid {
            envs.insert(ENV_VALIDATOR_UID.to_string(), validator_uid.to_string());
        }

        let (host, container) = match role {
            Role::Validator => VALIDATOR_SCRIPT_MOUNT,
            Role::FullNode => FULLNODE_SCRIPT_MOUNT,
        };
        let files = BTreeMap::from([(host.to_string(), container.to_string())]);

        Ok(WorkerSpec {
            uid,
            role,
            envs,
            files,
        })
    }
}

/// Generates `<prefix>-<random suffix>` from the OS random source.
pub fn new_random_name(prefix: &str) -> Result<String> {
    let mut bytes = [0u8; SUFFIX_LEN];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
        ScenarioError::Setup(format!("failed to generate identifier for `{prefix}`: {e}"))
    })?;

    let suffix: String = bytes
        .iter()
        .map(|b| SUFFIX_ALPHABET[*b as usize % SUFFIX_ALPHABET.len()] as char)
        .collect();
    let name = format!("{prefix}-{suffix}");

    if !is_dns1123_subdomain(&name) {
        return Err(ScenarioError::Setup(format!(
            "generated identifier `{name}` is not a valid DNS-1123 name"
        )));
    }
    Ok(name)
}

/// `[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*`
pub fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    name.split('.').all(|label| {
        let bytes = label.as_bytes();
        let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last)) => {
                label.len() <= MAX_LABEL_LEN
                    && alnum(first)
                    && alnum(last)
                    && bytes.iter().all(|b| alnum(b) || *b == b'-')
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns1123_names() {
        assert!(is_dns1123_subdomain("testplan01"));
        assert!(is_dns1123_subdomain("testplan01-consensus-ab12cd34"));
        assert!(is_dns1123_subdomain("a.b-c.d"));

        assert!(!is_dns1123_subdomain(""));
        assert!(!is_dns1123_subdomain("-leading"));
        assert!(!is_dns1123_subdomain("trailing-"));
        assert!(!is_dns1123_subdomain("Upper"));
        assert!(!is_dns1123_subdomain("under_score"));
        assert!(!is_dns1123_subdomain("double..dot"));
        assert!(!is_dns1123_subdomain(&"x".repeat(64)));
    }

    #[test]
    fn combined_topology_holds_both_roles_in_one_group() {
        let topology = TopologyBuilder::new("testplan01", TopologyMode::Combined)
            .full_nodes(2)
            .build()
            .unwrap();

        assert_eq!(topology.node_sets.len(), 1);
        let set = &topology.node_sets[0];
        assert!(set.uid.starts_with("testplan01-consensus-"));
        assert_eq!(set.workers.len(), 3);
        assert_eq!(set.workers[0].role, Role::Validator);

        let validator = topology.validator().unwrap();
        for full_node in topology.full_nodes() {
            assert_eq!(
                full_node.envs.get(ENV_VALIDATOR_UID),
                Some(&validator.uid)
            );
            assert_eq!(
                full_node.files.get(FULLNODE_SCRIPT_MOUNT.0).map(String::as_str),
                Some(FULLNODE_SCRIPT_MOUNT.1)
            );
        }
        assert!(!validator.envs.contains_key(ENV_VALIDATOR_UID));
    }

    #[test]
    fn split_topology_gives_each_worker_its_own_group() {
        let topology = TopologyBuilder::new("testplan01", TopologyMode::Split)
            .full_nodes(3)
            .extra_env("KEY", "VALUE")
            .build()
            .unwrap();

        assert_eq!(topology.node_sets.len(), 4);
        for set in &topology.node_sets {
            assert_eq!(set.workers.len(), 1);
            let worker = &set.workers[0];
            assert!(set.uid.starts_with(&format!("testplan01-{}-", worker.role)));
            assert_eq!(worker.envs.get("KEY").map(String::as_str), Some("VALUE"));
        }
    }

    #[test]
    fn every_worker_resolves_to_exactly_one_role() {
        for mode in [TopologyMode::Combined, TopologyMode::Split] {
            let topology = TopologyBuilder::new("testplan01", mode)
                .full_nodes(4)
                .build()
                .unwrap();

            let validators = topology
                .workers()
                .filter(|w| w.env().role() == Some(Role::Validator))
                .count();
            let full_nodes = topology
                .workers()
                .filter(|w| w.env().role() == Some(Role::FullNode))
                .count();
            assert_eq!(validators, 1);
            assert_eq!(full_nodes, 4);
            assert!(topology.workers().all(|w| w.env().role() == Some(w.role)));
        }
    }

    #[test]
    fn invalid_setup_is_rejected_without_partial_topology() {
        let err = TopologyBuilder::new("Not_Valid", TopologyMode::Combined)
            .build()
            .unwrap_err();
        assert!(matches!(err, ScenarioError::Setup(_)));

        let err = TopologyBuilder::new("testplan01", TopologyMode::Split)
            .full_nodes(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ScenarioError::Setup(_)));
    }

    #[test]
    fn mode_parses_from_cli_strings() {
        assert_eq!("split".parse::<TopologyMode>(), Ok(TopologyMode::Split));
        assert_eq!("combined".parse::<TopologyMode>(), Ok(TopologyMode::Combined));
        assert!("mesh".parse::<TopologyMode>().is_err());
    }
}
