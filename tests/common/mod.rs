//! Common utilities for distxn integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use distxn::prelude::*;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const COORDINATOR: CoordinatorId = CoordinatorId(0x2a);
pub const USER: &str = "app";

pub fn pid(name: &str) -> ParticipantId {
    ParticipantId::new(name)
}

pub fn pids(names: &[&str]) -> Vec<ParticipantId> {
    names.iter().map(|n| pid(n)).collect()
}

// --- MockCluster ---

/// State of one simulated data node.
#[derive(Debug)]
pub struct NodeState {
    pub reachable: bool,
    pub fail_prepare: bool,
    pub fail_commands: bool,
    /// The node records the prepare, then stalls this long before replying.
    pub prepare_delay: Option<Duration>,
    pub command_delay: Option<Duration>,
    pub prepared: BTreeSet<String>,
    pub committed: Vec<String>,
    pub rolled_back: Vec<String>,
    pub plain_rollbacks: usize,
    pub executed: Vec<String>,
    pub connects: usize,
    pub closes: usize,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            reachable: true,
            fail_prepare: false,
            fail_commands: false,
            prepare_delay: None,
            command_delay: None,
            prepared: BTreeSet::new(),
            committed: Vec::new(),
            rolled_back: Vec::new(),
            plain_rollbacks: 0,
            executed: Vec::new(),
            connects: 0,
            closes: 0,
        }
    }
}

/// In-memory stand-in for a set of participants speaking a
/// prepared-transaction protocol.
#[derive(Default)]
pub struct MockCluster {
    nodes: Mutex<HashMap<ParticipantId, NodeState>>,
}

impl MockCluster {
    pub fn new(names: &[&str]) -> Arc<Self> {
        let cluster = Self::default();
        for name in names {
            cluster.nodes.lock().insert(pid(name), NodeState::default());
        }
        Arc::new(cluster)
    }

    /// Runs `f` against the state of `name`.
    pub fn with_node<R>(&self, name: &str, f: impl FnOnce(&mut NodeState) -> R) -> R {
        let mut nodes = self.nodes.lock();
        let node = nodes.get_mut(&pid(name)).expect("unknown mock node");
        f(node)
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        self.with_node(name, |n| n.reachable = reachable);
    }

    pub fn fail_prepare(&self, name: &str) {
        self.with_node(name, |n| n.fail_prepare = true);
    }

    pub fn fail_commands(&self, name: &str) {
        self.with_node(name, |n| n.fail_commands = true);
    }

    pub fn stall_prepare(&self, name: &str, delay: Duration) {
        self.with_node(name, |n| n.prepare_delay = Some(delay));
    }

    pub fn stall_commands(&self, name: &str, delay: Duration) {
        self.with_node(name, |n| n.command_delay = Some(delay));
    }

    /// Leaves a prepared transaction on the node, as an interrupted
    /// coordinator would.
    pub fn inject_prepared(&self, name: &str, gid: &str) {
        self.with_node(name, |n| n.prepared.insert(gid.to_string()));
    }

    pub fn prepared(&self, name: &str) -> Vec<String> {
        self.with_node(name, |n| n.prepared.iter().cloned().collect())
    }

    pub fn committed(&self, name: &str) -> Vec<String> {
        self.with_node(name, |n| n.committed.clone())
    }

    pub fn rolled_back(&self, name: &str) -> Vec<String> {
        self.with_node(name, |n| n.rolled_back.clone())
    }

    pub fn plain_rollbacks(&self, name: &str) -> usize {
        self.with_node(name, |n| n.plain_rollbacks)
    }

    pub fn executed(&self, name: &str) -> Vec<String> {
        self.with_node(name, |n| n.executed.clone())
    }

    pub fn connects(&self, name: &str) -> usize {
        self.with_node(name, |n| n.connects)
    }

    pub fn closes(&self, name: &str) -> usize {
        self.with_node(name, |n| n.closes)
    }

    fn check_reachable(&self, participant: &ParticipantId) -> TransportResult<()> {
        match self.nodes.lock().get(participant) {
            Some(node) if node.reachable => Ok(()),
            _ => Err(TransportError::Unreachable(format!("{participant} is down"))),
        }
    }

    fn update<R>(&self, participant: &ParticipantId, f: impl FnOnce(&mut NodeState) -> R) -> TransportResult<R> {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(participant) {
            Some(node) if node.reachable => Ok(f(node)),
            _ => Err(TransportError::Unreachable(format!("{participant} is down"))),
        }
    }
}

pub struct MockSession {
    cluster: Arc<MockCluster>,
    participant: ParticipantId,
    closed: bool,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn begin(&mut self, _isolation: IsolationScope) -> TransportResult<()> {
        self.cluster.check_reachable(&self.participant)
    }

    async fn execute(&mut self, command: &str) -> TransportResult<CommandResponse> {
        let delay = self.cluster.update(&self.participant, |n| n.command_delay)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.cluster.update(&self.participant, |n| {
            if n.fail_commands {
                return Err(TransportError::Rejected(format!("cannot run {command}")));
            }
            n.executed.push(command.to_string());
            Ok(CommandResponse {
                status: "OK".to_string(),
                rows: Vec::new(),
            })
        })?
    }

    async fn rollback(&mut self) -> TransportResult<()> {
        self.cluster.update(&self.participant, |n| n.plain_rollbacks += 1)
    }

    async fn prepare(&mut self, gid: &str) -> TransportResult<()> {
        let delay = self.cluster.update(&self.participant, |n| {
            if n.fail_prepare {
                return Err(TransportError::Rejected("could not serialize access".to_string()));
            }
            n.prepared.insert(gid.to_string());
            Ok(n.prepare_delay)
        })??;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn commit_prepared(&mut self, gid: &str) -> TransportResult<()> {
        self.cluster.update(&self.participant, |n| {
            if !n.prepared.remove(gid) {
                return Err(TransportError::NoSuchTransaction(gid.to_string()));
            }
            n.committed.push(gid.to_string());
            Ok(())
        })?
    }

    async fn rollback_prepared(&mut self, gid: &str) -> TransportResult<()> {
        self.cluster.update(&self.participant, |n| {
            if !n.prepared.remove(gid) {
                return Err(TransportError::NoSuchTransaction(gid.to_string()));
            }
            n.rolled_back.push(gid.to_string());
            Ok(())
        })?
    }

    async fn list_in_doubt(&mut self) -> TransportResult<Vec<String>> {
        self.cluster
            .update(&self.participant, |n| n.prepared.iter().cloned().collect())
    }

    fn is_healthy(&self) -> bool {
        !self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
        if let Some(node) = self.cluster.nodes.lock().get_mut(&self.participant) {
            node.closes += 1;
        }
    }
}

pub struct MockConnector {
    cluster: Arc<MockCluster>,
}

impl MockConnector {
    pub fn new(cluster: Arc<MockCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, participant: &ParticipantInfo, _user: &str) -> TransportResult<Box<dyn RemoteSession>> {
        self.cluster.update(&participant.id, |n| n.connects += 1)?;
        Ok(Box::new(MockSession {
            cluster: self.cluster.clone(),
            participant: participant.id.clone(),
            closed: false,
        }))
    }
}

// --- FailingDecisionLog ---

/// Decision log whose first `failures` writes fail.
pub struct FailingDecisionLog {
    pub inner: MemoryDecisionLog,
    failures: AtomicU32,
    lookup_failures: AtomicU32,
    /// A failed write still reaches storage, as after a lost fsync reply.
    persist_failed: bool,
}

impl FailingDecisionLog {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryDecisionLog::new(),
            failures: AtomicU32::new(failures),
            lookup_failures: AtomicU32::new(0),
            persist_failed: false,
        }
    }

    pub fn persisting(mut self) -> Self {
        self.persist_failed = true;
        self
    }

    /// The first `n` lookups fail as well.
    pub fn failing_lookups(self, n: u32) -> Self {
        self.lookup_failures.store(n, Ordering::SeqCst);
        self
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl DecisionLog for FailingDecisionLog {
    fn write(&self, record: &DecisionRecord) -> Result<()> {
        if Self::take(&self.failures) {
            if self.persist_failed {
                let _ = self.inner.write(record);
            }
            return Err(DistTxnError::Storage("disk full".to_string()));
        }
        self.inner.write(record)
    }

    fn lookup(&self, gid: &Gid) -> Result<Option<Outcome>> {
        if Self::take(&self.lookup_failures) {
            return Err(DistTxnError::Storage("read error".to_string()));
        }
        self.inner.lookup(gid)
    }

    fn acknowledge(&self, gid: &Gid) -> Result<()> {
        self.inner.acknowledge(gid)
    }

    fn records(&self) -> Result<Vec<DecisionRecord>> {
        self.inner.records()
    }

    fn collect_garbage(&self, retention: Duration) -> Result<usize> {
        self.inner.collect_garbage(retention)
    }
}

// --- Helper Functions ---

/// Configuration with short timeouts so stalled participants fail fast.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::new(COORDINATOR);
    config.call_timeout = Duration::from_millis(200);
    config.connect_timeout = Duration::from_millis(200);
    config.decision_write_backoff = Duration::from_millis(1);
    config.decision_write_max_backoff = Duration::from_millis(4);
    config
}

pub fn registry_for(names: &[&str]) -> Arc<StaticRegistry> {
    Arc::new(StaticRegistry::with_participants(
        names
            .iter()
            .map(|n| ParticipantInfo::new(*n, format!("{n}.local"), 5432, "app")),
    ))
}

/// A started extension over a mock cluster.
pub struct Harness {
    pub cluster: Arc<MockCluster>,
    pub registry: Arc<StaticRegistry>,
    pub ext: Extension,
}

impl Harness {
    pub fn begin(&self, local_xid: u64) -> RemoteTxnTracker {
        self.ext.begin(local_xid, USER, IsolationScope::RepeatableRead)
    }

    /// Opens a branch on every node and runs one insert there.
    pub async fn begin_with_work(&self, local_xid: u64, names: &[&str]) -> RemoteTxnTracker {
        let mut tracker = self.begin(local_xid);
        self.ext
            .execute(
                &mut tracker,
                &pids(names),
                "INSERT INTO metrics VALUES (1)",
                ExecMode::FailFast,
                Dispatch::Parallel,
            )
            .await
            .expect("work failed");
        tracker
    }

    pub fn gid(&self, local_xid: u64, branch_seq: u32) -> String {
        GidCodec::new(COORDINATOR).encode(local_xid, branch_seq)
    }
}

pub fn harness_with(names: &[&str], log: Arc<dyn DecisionLog>, config: CoordinatorConfig) -> Harness {
    let cluster = MockCluster::new(names);
    let registry = registry_for(names);
    let ext = Extension::start(
        config,
        Arc::new(MockConnector::new(cluster.clone())),
        registry.clone(),
        log,
    )
    .expect("extension failed to start");
    Harness { cluster, registry, ext }
}

pub fn harness(names: &[&str], log: Arc<MemoryDecisionLog>) -> Harness {
    harness_with(names, log, test_config())
}
