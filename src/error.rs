//! Error types shared by every stage of the playbook.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = ScenarioError> = std::result::Result<T, E>;

/// Errors a worker can hit while bootstrapping or joining the network.
///
/// Every variant is fatal to the worker that raised it. Transient conditions
/// (a node that has not produced its first block yet) never surface here; the
/// poll loops absorb them.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Topology or identifier generation failed before any worker started.
    #[error("Setup error: {0}")]
    Setup(String),

    /// A required environment variable was not injected into the worker.
    #[error("Missing environment variable `{0}`")]
    Env(String),

    /// A script or node binary exited unsuccessfully.
    #[error("Command `{command}` failed with {status}, combined output: {output}")]
    Process {
        command: String,
        status: String,
        output: String,
    },

    /// A value read from the message exchange had the wrong shape.
    #[error("Unexpected payload under key `{key}`: {reason}")]
    Payload { key: String, reason: String },

    /// Local filesystem or process spawn failure.
    #[error("Failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Message exchange error: {0}")]
    Exchange(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Fault injector error: {0}")]
    Fault(String),

    #[error("Status probe error: {0}")]
    Http(String),

    /// A poll loop ran out of its configured attempt budget.
    #[error("Gave up waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),
}

impl ScenarioError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn payload(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Payload {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

impl From<figment::Error> for ScenarioError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}
