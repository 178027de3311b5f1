//! Typed access to the handshake keys on the message exchange.
//!
//! The exchange itself stores untyped JSON values. All shape checks for the
//! two keys this scenario uses live here, so a corrupt or misused entry shows
//! up as a single `ScenarioError::Payload` kind.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, ScenarioError};
use crate::runtime::{ContentId, MessageExchange};

pub const GENESIS_FILE_ID_KEY: &str = "GENESIS_FILE_ID";
pub const SEED_KEY: &str = "SEED";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyScope {
    /// Keys carry the publishing worker's identity as a suffix.
    #[default]
    PerWorker,
    /// One key per run, shared by every reader.
    Global,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangeKeys {
    scope: KeyScope,
}

impl ExchangeKeys {
    pub fn new(scope: KeyScope) -> Self {
        Self { scope }
    }

    pub fn genesis_file_id(&self, validator_uid: &str) -> String {
        self.scoped(GENESIS_FILE_ID_KEY, validator_uid)
    }

    pub fn seed(&self, validator_uid: &str) -> String {
        self.scoped(SEED_KEY, validator_uid)
    }

    fn scoped(&self, base: &str, uid: &str) -> String {
        match self.scope {
            KeyScope::PerWorker => format!("{base}_{uid}"),
            KeyScope::Global => base.to_string(),
        }
    }
}

/// Dialable validator address, `<node-id>@<ip>:<port>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerDescriptor {
    pub node_id: String,
    pub addr: SocketAddr,
}

impl PeerDescriptor {
    pub fn new(node_id: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            addr: SocketAddr::new(ip, port),
        }
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}

impl FromStr for PeerDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node_id, addr) = s
            .split_once('@')
            .ok_or_else(|| format!("`{s}` is missing the `@` separator"))?;
        if node_id.is_empty() || node_id.chars().any(|c| c.is_whitespace()) {
            return Err(format!("`{s}` has an invalid node id"));
        }
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("`{s}` has an invalid address: {e}"))?;
        Ok(Self {
            node_id: node_id.to_string(),
            addr,
        })
    }
}

/// The handshake as seen through the exchange.
pub struct Handshake<'a> {
    exchange: &'a dyn MessageExchange,
    keys: ExchangeKeys,
}

impl<'a> Handshake<'a> {
    pub fn new(exchange: &'a dyn MessageExchange, keys: ExchangeKeys) -> Self {
        Self { exchange, keys }
    }

    /// Callers must have pushed the blob before publishing its id.
    pub async fn publish_genesis_id(&self, validator_uid: &str, id: &ContentId) -> Result<()> {
        let key = self.keys.genesis_file_id(validator_uid);
        self.exchange
            .set(&key, Value::String(id.to_string()))
            .await?;
        info!(%key, content_id = %id, "Published genesis file id");
        Ok(())
    }

    pub async fn read_genesis_id(
        &self,
        validator_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<ContentId> {
        let key = self.keys.genesis_file_id(validator_uid);
        let value = self.exchange.get_waiting(&key, cancel).await?;
        let id = expect_string(&key, value)?;
        if id.is_empty() {
            return Err(ScenarioError::payload(key, "empty content id"));
        }
        Ok(ContentId::from(id))
    }

    pub async fn publish_peer(&self, validator_uid: &str, peer: &PeerDescriptor) -> Result<()> {
        let key = self.keys.seed(validator_uid);
        self.exchange
            .set(&key, Value::String(peer.to_string()))
            .await?;
        info!(%key, %peer, "Published validator seed");
        Ok(())
    }

    pub async fn read_peer(
        &self,
        validator_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<PeerDescriptor> {
        let key = self.keys.seed(validator_uid);
        let value = self.exchange.get_waiting(&key, cancel).await?;
        expect_string(&key, value)?
            .parse()
            .map_err(|reason: String| ScenarioError::payload(key, reason))
    }
}

fn expect_string(key: &str, value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ScenarioError::payload(
            key,
            format!("expected a string, got {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::InMemoryExchange;
    use serde_json::json;
    use std::net::Ipv4Addr;

    #[test]
    fn keys_follow_scope() {
        let per_worker = ExchangeKeys::new(KeyScope::PerWorker);
        assert_eq!(per_worker.genesis_file_id("validator-x1"), "GENESIS_FILE_ID_validator-x1");
        assert_eq!(per_worker.seed("validator-x1"), "SEED_validator-x1");

        let global = ExchangeKeys::new(KeyScope::Global);
        assert_eq!(global.genesis_file_id("validator-x1"), "GENESIS_FILE_ID");
        assert_eq!(global.seed("validator-x1"), "SEED");
    }

    #[test]
    fn peer_descriptor_parses_and_formats() {
        let peer: PeerDescriptor = "nodeid@10.0.0.2:26656".parse().unwrap();
        assert_eq!(peer.node_id, "nodeid");
        assert_eq!(
            peer,
            PeerDescriptor::new("nodeid", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 26656)
        );
        assert_eq!(peer.to_string(), "nodeid@10.0.0.2:26656");

        assert!("10.0.0.2:26656".parse::<PeerDescriptor>().is_err());
        assert!("@10.0.0.2:26656".parse::<PeerDescriptor>().is_err());
        assert!("nodeid@10.0.0.2".parse::<PeerDescriptor>().is_err());
        assert!("node id@10.0.0.2:1".parse::<PeerDescriptor>().is_err());
    }

    #[tokio::test]
    async fn typed_reads_reject_wrong_shapes() {
        let exchange = InMemoryExchange::new();
        let handshake = Handshake::new(&exchange, ExchangeKeys::new(KeyScope::PerWorker));
        let cancel = CancellationToken::new();

        exchange.set("GENESIS_FILE_ID_v", json!(42)).await.unwrap();
        exchange.set("SEED_v", json!("not-a-descriptor")).await.unwrap();

        let err = handshake.read_genesis_id("v", &cancel).await.unwrap_err();
        assert!(
            matches!(err, ScenarioError::Payload { ref key, .. } if key == "GENESIS_FILE_ID_v")
        );

        let err = handshake.read_peer("v", &cancel).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Payload { ref key, .. } if key == "SEED_v"));
    }

    #[tokio::test]
    async fn published_values_read_back_typed() {
        let exchange = InMemoryExchange::new();
        let handshake = Handshake::new(&exchange, ExchangeKeys::new(KeyScope::Global));
        let cancel = CancellationToken::new();
        let peer: PeerDescriptor = "abc@192.168.1.7:26656".parse().unwrap();

        handshake
            .publish_genesis_id("v", &ContentId::from("G1".to_string()))
            .await
            .unwrap();
        handshake.publish_peer("v", &peer).await.unwrap();

        assert_eq!(handshake.read_genesis_id("other", &cancel).await.unwrap().as_str(), "G1");
        assert_eq!(handshake.read_peer("other", &cancel).await.unwrap(), peer);
    }
}
