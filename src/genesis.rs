//! Where the node keeps its genesis file, and how it gets there.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::NodeConfig;
use crate::error::{Result, ScenarioError};
use crate::role::{WorkerEnv, ENV_HOME};

pub const NODE_HOME_DIR: &str = ".celestia-app";

/// Node home for a worker: configured explicitly, or `$HOME/.celestia-app`.
pub fn node_home(config: &NodeConfig, env: &WorkerEnv) -> Result<PathBuf> {
    if let Some(home) = &config.home {
        return Ok(home.clone());
    }
    Ok(Path::new(env.require(ENV_HOME)?).join(NODE_HOME_DIR))
}

pub fn genesis_path(node_home: &Path) -> PathBuf {
    node_home.join("config").join("genesis.json")
}

pub async fn read_genesis(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ScenarioError::io("read genesis file", path, e))
}

/// Writes `bytes` verbatim, creating missing parent directories.
pub async fn write_genesis(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ScenarioError::io("create directory", parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| ScenarioError::io("write genesis file", path, e))?;
    debug!(path = %path.display(), size = bytes.len(), "Wrote genesis file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_home_prefers_config_then_worker_home() {
        let mut env = WorkerEnv::default();
        let mut config = NodeConfig::default();

        assert!(matches!(node_home(&config, &env), Err(ScenarioError::Env(_))));

        env.set(ENV_HOME, "/root");
        assert_eq!(
            genesis_path(&node_home(&config, &env).unwrap()),
            PathBuf::from("/root/.celestia-app/config/genesis.json")
        );

        config.home = Some(PathBuf::from("/data/node"));
        assert_eq!(node_home(&config, &env).unwrap(), PathBuf::from("/data/node"));
    }

    #[tokio::test]
    async fn write_creates_parents_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = genesis_path(&dir.path().join(NODE_HOME_DIR));
        let bytes = br#"{"genesis_time":"2024-01-01T00:00:00Z"}"#;

        write_genesis(&path, bytes).await.unwrap();
        assert_eq!(read_genesis(&path).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn io_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope/genesis.json");

        match read_genesis(&missing).await {
            Err(ScenarioError::Io { path, op, .. }) => {
                assert_eq!(path, missing);
                assert_eq!(op, "read genesis file");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
