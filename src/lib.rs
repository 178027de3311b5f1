//! Consensus bootstrap playbook.
//!
//! Boots one validator and one or more full nodes inside an orchestration
//! framework. The validator publishes its genesis file and, once its chain is
//! live, its dialable address; full nodes wait for both and join.

pub mod config;
pub mod error;
pub mod exchange;
pub mod fullnode;
pub mod genesis;
pub mod health;
pub mod logging;
pub mod playbook;
pub mod poll;
pub mod process;
pub mod role;
pub mod runtime;
pub mod topology;
pub mod validator;

pub use config::ScenarioConfig;
pub use error::{Result, ScenarioError};
pub use exchange::PeerDescriptor;
pub use playbook::{ConsensusPlaybook, Playbook};
pub use role::{Role, WorkerEnv};
pub use runtime::{LocalRuntime, Worker, WorkerOutcome};
pub use topology::{Topology, TopologyBuilder, TopologyMode};
