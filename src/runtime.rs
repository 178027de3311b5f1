//! Worker runtime seams.
//!
//! The orchestration framework owns scheduling, the message exchange, blob
//! storage and fault injection. The traits below are the only surface this
//! crate relies on. In-memory implementations back the local harness, the
//! demo and the tests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Result, ScenarioError};
use crate::playbook::Playbook;
use crate::role::{Role, WorkerEnv, ENV_HOME};
use crate::topology::{Topology, WorkerSpec, WorkerUid};

/// Identifier returned by the blob store for pushed content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentId(String);

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run-wide key/value coordination shared by every worker.
#[async_trait]
pub trait MessageExchange: Send + Sync {
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Blocks until `key` exists.
    async fn get_waiting(&self, key: &str, cancel: &CancellationToken) -> Result<Value>;

    /// Blocks until the worker `uid` has registered its network address.
    async fn ip_waiting(&self, uid: &str, cancel: &CancellationToken) -> Result<IpAddr>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns only once the content is retrievable.
    async fn push(&self, data: Vec<u8>) -> Result<ContentId>;

    async fn pull(&self, id: &ContentId) -> Result<Vec<u8>>;
}

/// Per-worker synthetic network faults.
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn set_packet_loss_rate(&self, percent: u32) -> Result<()>;

    async fn clear_packet_loss(&self) -> Result<()>;
}

/// Runs `body` under the given packet loss and clears it afterwards,
/// whatever the outcome. `None` runs `body` untouched.
pub async fn with_packet_loss<T, F>(
    faults: &dyn FaultInjector,
    rate: Option<u32>,
    body: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(rate) = rate else {
        return body.await;
    };

    faults.set_packet_loss_rate(rate).await?;
    info!(rate, "Applied packet loss");

    let result = body.await;
    match faults.clear_packet_loss().await {
        Ok(()) => info!("Cleared packet loss"),
        Err(e) => warn!(error = %e, "Failed to clear packet loss"),
    }
    result
}

/// Everything a role coordinator gets from the runtime.
#[derive(Clone)]
pub struct Worker {
    pub uid: WorkerUid,
    pub env: WorkerEnv,
    pub local_ip: IpAddr,
    pub message: Arc<dyn MessageExchange>,
    pub blobs: Arc<dyn BlobStore>,
    pub faults: Arc<dyn FaultInjector>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("uid", &self.uid)
            .field("local_ip", &self.local_ip)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct InMemoryExchange {
    entries: RwLock<HashMap<String, Value>>,
    ips: RwLock<HashMap<String, IpAddr>>,
    changed: Notify,
    calls: AtomicUsize,
}

impl InMemoryExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_ip(&self, uid: &str, ip: IpAddr) {
        write(&self.ips).insert(uid.to_string(), ip);
        self.changed.notify_waiters();
    }

    /// Non-blocking read for inspection.
    pub fn peek(&self, key: &str) -> Option<Value> {
        read(&self.entries).get(key).cloned()
    }

    /// Number of trait calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn wait_for<T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        lookup: impl Fn(&Self) -> Option<T>,
    ) -> Result<T> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = lookup(self) {
                return Ok(found);
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {
                    return Err(ScenarioError::Cancelled(format!("waiting for {what}")));
                }
            }
        }
    }
}

#[async_trait]
impl MessageExchange for InMemoryExchange {
    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut entries = write(&self.entries);
            if entries.contains_key(key) {
                return Err(ScenarioError::Exchange(format!("key `{key}` is already set")));
            }
            entries.insert(key.to_string(), value);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn get_waiting(&self, key: &str, cancel: &CancellationToken) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for(&format!("key `{key}`"), cancel, |this| this.peek(key))
            .await
    }

    async fn ip_waiting(&self, uid: &str, cancel: &CancellationToken) -> Result<IpAddr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for(&format!("address of `{uid}`"), cancel, |this| {
            read(&this.ips).get(uid).copied()
        })
        .await
    }
}

/// Content-addressed store keyed by the SHA-256 of the content.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        read(&self.blobs).contains_key(id)
    }
}

pub fn content_id(data: &[u8]) -> ContentId {
    ContentId(hex::encode(Sha256::digest(data)))
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn push(&self, data: Vec<u8>) -> Result<ContentId> {
        let id = content_id(&data);
        write(&self.blobs).insert(id.clone(), data);
        Ok(id)
    }

    async fn pull(&self, id: &ContentId) -> Result<Vec<u8>> {
        read(&self.blobs)
            .get(id)
            .cloned()
            .ok_or_else(|| ScenarioError::Blob(format!("no content with id `{id}`")))
    }
}

/// Records the loss rate instead of shaping traffic.
#[derive(Default)]
pub struct InMemoryFaultInjector {
    history: RwLock<Vec<Option<u32>>>,
}

impl InMemoryFaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<u32> {
        read(&self.history).last().copied().flatten()
    }

    /// Every rate change in order; `None` marks a clear.
    pub fn history(&self) -> Vec<Option<u32>> {
        read(&self.history).clone()
    }
}

#[async_trait]
impl FaultInjector for InMemoryFaultInjector {
    async fn set_packet_loss_rate(&self, percent: u32) -> Result<()> {
        if percent > 100 {
            return Err(ScenarioError::Fault(format!("invalid loss rate {percent}%")));
        }
        write(&self.history).push(Some(percent));
        Ok(())
    }

    async fn clear_packet_loss(&self) -> Result<()> {
        write(&self.history).push(None);
        Ok(())
    }
}

#[derive(Debug)]
pub struct WorkerOutcome {
    pub uid: WorkerUid,
    pub role: Role,
    pub result: Result<()>,
}

/// Runs every worker of a topology as a task in this process.
///
/// Workers get addresses `10.0.0.2`, `10.0.0.3`, ... in topology order and a
/// private `HOME` beneath `base_home`, so their node files never overlap.
pub struct LocalRuntime {
    exchange: Arc<InMemoryExchange>,
    blobs: Arc<InMemoryBlobStore>,
    faults: RwLock<HashMap<WorkerUid, Arc<InMemoryFaultInjector>>>,
    base_home: PathBuf,
    cancel: CancellationToken,
}

impl LocalRuntime {
    pub fn new(base_home: impl Into<PathBuf>) -> Self {
        Self {
            exchange: Arc::new(InMemoryExchange::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            faults: RwLock::new(HashMap::new()),
            base_home: base_home.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn exchange(&self) -> Arc<InMemoryExchange> {
        self.exchange.clone()
    }

    pub fn blobs(&self) -> Arc<InMemoryBlobStore> {
        self.blobs.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn fault_injector(&self, uid: &str) -> Option<Arc<InMemoryFaultInjector>> {
        read(&self.faults).get(uid).cloned()
    }

    pub fn home_of(&self, uid: &str) -> PathBuf {
        self.base_home.join(uid)
    }

    /// Materializes one worker and registers its address on the exchange.
    pub fn worker(&self, spec: &WorkerSpec, local_ip: IpAddr) -> Worker {
        let mut env = spec.env();
        env.set(ENV_HOME, self.home_of(&spec.uid).to_string_lossy().into_owned());

        let faults = Arc::new(InMemoryFaultInjector::new());
        write(&self.faults).insert(spec.uid.clone(), faults.clone());
        self.exchange.register_ip(&spec.uid, local_ip);

        Worker {
            uid: spec.uid.clone(),
            env,
            local_ip,
            message: self.exchange.clone(),
            blobs: self.blobs.clone(),
            faults,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn workers(&self, topology: &Topology) -> Vec<Worker> {
        topology
            .workers()
            .enumerate()
            .map(|(i, spec)| self.worker(spec, local_address(i)))
            .collect()
    }

    /// Spawns every worker and waits for all of them to return.
    pub async fn run<P>(&self, playbook: Arc<P>, topology: &Topology) -> Vec<WorkerOutcome>
    where
        P: Playbook + 'static,
    {
        let mut handles = Vec::new();
        for (i, spec) in topology.workers().enumerate() {
            let worker = self.worker(spec, local_address(i));
            let playbook = playbook.clone();
            let role = spec.role;
            info!(uid = %worker.uid, %role, ip = %worker.local_ip, "Starting worker");
            handles.push((
                worker.uid.clone(),
                role,
                tokio::spawn(async move { playbook.run_worker(&worker).await }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (uid, role, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ScenarioError::Setup(format!("worker task failed: {e}"))),
            };
            match &result {
                Ok(()) => info!(%uid, %role, "Worker finished"),
                Err(e) if e.is_cancelled() => info!(%uid, %role, "Worker stopped"),
                Err(e) => error!(%uid, %role, error = %e, "Worker failed"),
            }
            outcomes.push(WorkerOutcome { uid, role, result });
        }
        outcomes
    }
}

fn local_address(index: usize) -> IpAddr {
    let host = u8::try_from(index + 2).unwrap_or(u8::MAX);
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, host))
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn blob_round_trip_is_byte_identical() {
        let store = InMemoryBlobStore::new();
        let genesis = br#"{"chain_id":"test","initial_height":"1"}"#.to_vec();

        let id = store.push(genesis.clone()).await.unwrap();
        assert_eq!(id.as_str().len(), 64);
        assert_eq!(store.pull(&id).await.unwrap(), genesis);

        let missing = ContentId::from("deadbeef".to_string());
        assert!(matches!(store.pull(&missing).await, Err(ScenarioError::Blob(_))));
    }

    #[tokio::test]
    async fn readers_block_until_key_is_set() {
        let exchange = Arc::new(InMemoryExchange::new());
        let reader = exchange.clone();
        let waiting = tokio::spawn(async move {
            reader
                .get_waiting("SEED_v", &CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        exchange.set("SEED_v", json!("a@10.0.0.2:26656")).await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), json!("a@10.0.0.2:26656"));
    }

    #[tokio::test]
    async fn keys_are_set_at_most_once() {
        let exchange = InMemoryExchange::new();
        exchange.set("k", json!("one")).await.unwrap();
        assert!(matches!(
            exchange.set("k", json!("two")).await,
            Err(ScenarioError::Exchange(_))
        ));
        assert_eq!(exchange.peek("k"), Some(json!("one")));
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn waits_honour_cancellation() {
        let exchange = InMemoryExchange::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = exchange.ip_waiting("nobody", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn fault_injector_records_changes() {
        let faults = InMemoryFaultInjector::new();
        faults.set_packet_loss_rate(10).await.unwrap();
        assert_eq!(faults.current(), Some(10));
        faults.clear_packet_loss().await.unwrap();
        assert_eq!(faults.current(), None);
        assert_eq!(faults.history(), vec![Some(10), None]);
        assert!(faults.set_packet_loss_rate(101).await.is_err());
    }
}
