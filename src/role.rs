use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScenarioError};

/// Env var selecting the role a worker plays.
pub const ENV_NODE_TYPE: &str = "NODE_TYPE";
/// Env var carrying the validator's worker identity (full nodes only).
pub const ENV_VALIDATOR_UID: &str = "VALIDATOR_UID";
/// Home directory of the worker; node state lives beneath it.
pub const ENV_HOME: &str = "HOME";

// Role is fixed at topology-build time and never changes for a worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Validator,
    FullNode,
}

impl Role {
    pub fn as_env_value(&self) -> &'static str {
        match self {
            Role::Validator => "VALIDATOR",
            Role::FullNode => "FULL_NODE",
        }
    }

    /// Unknown values resolve to `None`; the worker then has nothing to do.
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value {
            "VALIDATOR" => Some(Role::Validator),
            "FULL_NODE" => Some(Role::FullNode),
            _ => None,
        }
    }

    /// Prefix used when generating worker identities for this role.
    pub fn uid_prefix(&self) -> &'static str {
        match self {
            Role::Validator => "validator",
            Role::FullNode => "fullnode",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.uid_prefix())
    }
}

/// Environment explicitly injected into one worker.
///
/// Coordinators read identity and role only from here, never from
/// process-wide state, so several workers can share one process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerEnv {
    vars: BTreeMap<String, String>,
}

impl WorkerEnv {
    pub fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| ScenarioError::Env(key.to_string()))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn role(&self) -> Option<Role> {
        self.get(ENV_NODE_TYPE).and_then(Role::from_env_value)
    }
}

impl FromIterator<(String, String)> for WorkerEnv {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_env_value() {
        for role in [Role::Validator, Role::FullNode] {
            assert_eq!(Role::from_env_value(role.as_env_value()), Some(role));
        }
        assert_eq!(Role::from_env_value("BRIDGE"), None);
        assert_eq!(Role::from_env_value(""), None);
    }

    #[test]
    fn worker_env_resolves_role_and_required_vars() {
        let mut env = WorkerEnv::default();
        assert_eq!(env.role(), None);

        env.set(ENV_NODE_TYPE, "FULL_NODE");
        assert_eq!(env.role(), Some(Role::FullNode));

        match env.require(ENV_VALIDATOR_UID) {
            Err(ScenarioError::Env(key)) => assert_eq!(key, ENV_VALIDATOR_UID),
            other => panic!("expected env error, got {other:?}"),
        }

        env.set(ENV_VALIDATOR_UID, "validator-abc");
        assert_eq!(env.require(ENV_VALIDATOR_UID).unwrap(), "validator-abc");
    }
}
