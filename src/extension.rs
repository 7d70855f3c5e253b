//! The surface a host database sees.
//!
//! [`Extension`] wires the components together at load time and tears
//! them down in reverse order at unload. The host drives it through two
//! channels: [`DistTxnEntryPoints`] for explicit calls, and
//! [`Extension::on_txn_event`] for the lifecycle of its local transactions.

use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::connection_cache::{
    invalidation_channel, CacheEntryInfo, ConnectionCache, Invalidation, InvalidationNotifier,
};
use crate::coordinator::{CommitReport, PreparedTxn, TwoPhaseCoordinator};
use crate::decision::{DecisionLog, MemoryDecisionLog, Outcome};
use crate::errors::Result;
use crate::executor::{CommandExecutor, Dispatch, ExecMode, ExecutionResult};
use crate::heal::{HealReport, HealStats, Resolver};
use crate::isolation::IsolationScope;
use crate::participant::{Connector, ParticipantId, ParticipantRegistry};
use crate::tracker::RemoteTxnTracker;

/// Calls the host makes into the distributed transaction layer.
#[async_trait]
pub trait DistTxnEntryPoints: Send + Sync {
    /// Prepares every branch of `tracker` and persists the decision.
    /// The outcome is delivered on the following commit event.
    async fn prepare(&self, tracker: RemoteTxnTracker) -> Result<Outcome>;

    async fn commit_branch(&self, participant: &ParticipantId, gid: &str) -> Result<bool>;

    async fn rollback_branch(&self, participant: &ParticipantId, gid: &str) -> Result<bool>;

    async fn heal(&self, participant: &ParticipantId) -> Result<HealReport>;

    async fn cache_invalidate(&self, target: Invalidation);
}

/// Lifecycle events of a local transaction.
#[derive(Debug)]
pub enum LocalTxnEvent {
    /// The local transaction is about to commit. Its branches are prepared
    /// and the decision is made durable before the local commit is visible.
    PreCommit(RemoteTxnTracker),
    /// The local transaction committed.
    Commit { local_xid: u64 },
    /// The local transaction aborted. Carries the tracker unless it was
    /// already handed over at pre-commit.
    Abort {
        local_xid: u64,
        tracker: Option<RemoteTxnTracker>,
    },
}

/// Result of [`Extension::run_maintenance`].
#[derive(Debug)]
pub struct MaintenanceReport {
    pub healed: Vec<(ParticipantId, Result<HealReport>)>,
    pub collected: usize,
}

/// A running instance of the distributed transaction layer.
pub struct Extension {
    config: CoordinatorConfig,
    registry: Arc<dyn ParticipantRegistry>,
    log: Arc<dyn DecisionLog>,
    cache: Arc<ConnectionCache>,
    notifier: InvalidationNotifier,
    executor: CommandExecutor,
    coordinator: TwoPhaseCoordinator,
    resolver: Resolver,
    pending: Mutex<BTreeMap<u64, PreparedTxn>>,
}

impl Extension {
    /// Initializes the connection cache, then the transaction layer on top.
    pub fn start(
        config: CoordinatorConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<dyn ParticipantRegistry>,
        log: Arc<dyn DecisionLog>,
    ) -> Result<Self> {
        config.validate()?;

        let (notifier, invalidations) = invalidation_channel();
        let cache = Arc::new(
            ConnectionCache::new(connector, registry.clone(), &config).with_invalidations(invalidations),
        );
        let executor = CommandExecutor::new(&config);
        let coordinator = TwoPhaseCoordinator::new(log.clone(), &config);
        let resolver = Resolver::new(cache.clone(), log.clone(), coordinator.in_flight().clone(), &config);

        info!("distributed transactions started for coordinator {}", config.coordinator_id);
        Ok(Self {
            config,
            registry,
            log,
            cache,
            notifier,
            executor,
            coordinator,
            resolver,
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    /// Opens the decision log named by the configuration: RocksDB at
    /// `decision_log_path` if set, process memory otherwise.
    pub fn open_decision_log(config: &CoordinatorConfig) -> Result<Arc<dyn DecisionLog>> {
        match &config.decision_log_path {
            #[cfg(feature = "rocksdb-store")]
            Some(path) => Ok(Arc::new(crate::decision::RocksDecisionLog::open(path)?)),
            #[cfg(not(feature = "rocksdb-store"))]
            Some(path) => Err(crate::errors::DistTxnError::Config(format!(
                "decision_log_path {} needs the rocksdb-store feature",
                path.display()
            ))),
            None => Ok(Arc::new(MemoryDecisionLog::new())),
        }
    }

    /// Tears down in reverse order of [`Extension::start`]: the transaction
    /// layer first, then the connection cache.
    pub async fn shutdown(self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            warn!(
                "shutting down with {} decided transactions not finalized; heal will finish them",
                pending.len()
            );
        }
        for (_, mut prepared) in pending {
            prepared.release_connections().await;
        }
        self.cache.close().await;
        info!("distributed transactions stopped for coordinator {}", self.config.coordinator_id);
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ParticipantRegistry> {
        &self.registry
    }

    pub fn decision_log(&self) -> &Arc<dyn DecisionLog> {
        &self.log
    }

    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &TwoPhaseCoordinator {
        &self.coordinator
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Handle for the host's catalog-change hook.
    pub fn notifier(&self) -> InvalidationNotifier {
        self.notifier.clone()
    }

    pub fn cache_show(&self) -> Vec<CacheEntryInfo> {
        self.cache.show()
    }

    pub fn heal_stats(&self) -> HealStats {
        self.resolver.stats()
    }

    /// Starts tracking the remote branches of a local transaction.
    pub fn begin(&self, local_xid: u64, user: impl Into<String>, isolation: IsolationScope) -> RemoteTxnTracker {
        RemoteTxnTracker::new(local_xid, user, isolation, self.cache.clone(), &self.config)
    }

    pub async fn execute(
        &self,
        tracker: &mut RemoteTxnTracker,
        participants: &[ParticipantId],
        command: &str,
        mode: ExecMode,
        dispatch: Dispatch,
    ) -> Result<ExecutionResult> {
        self.executor
            .execute(tracker, participants, command, mode, dispatch)
            .await
    }

    /// Reacts to a local transaction event.
    ///
    /// * `PreCommit`: prepares and decides. An abort decision is delivered
    ///   at once and returned as the error that must fail the local commit.
    /// * `Commit`: delivers the decided outcome.
    /// * `Abort`: rolls the branches back. If the decision was already
    ///   durable the recorded outcome is delivered instead, so participants
    ///   agree with what heal would do.
    pub async fn on_txn_event(&self, event: LocalTxnEvent) -> Result<Option<CommitReport>> {
        match event {
            LocalTxnEvent::PreCommit(tracker) => {
                self.pre_commit(tracker).await?;
                Ok(None)
            }
            LocalTxnEvent::Commit { local_xid } => {
                let prepared = self.pending.lock().remove(&local_xid);
                match prepared {
                    Some(prepared) => Ok(Some(self.coordinator.finalize(prepared).await.into_result()?)),
                    None => Ok(None),
                }
            }
            LocalTxnEvent::Abort { local_xid, tracker } => {
                let prepared = self.pending.lock().remove(&local_xid);
                if let Some(prepared) = prepared {
                    error!(
                        "local transaction {} aborted after its {} decision became durable",
                        local_xid,
                        prepared.outcome()
                    );
                    return Ok(Some(self.coordinator.finalize(prepared).await));
                }
                match tracker {
                    Some(tracker) if !tracker.is_empty() => Ok(Some(self.coordinator.abort(tracker).await?)),
                    _ => Ok(None),
                }
            }
        }
    }

    async fn pre_commit(&self, tracker: RemoteTxnTracker) -> Result<Outcome> {
        if tracker.is_empty() {
            return Ok(Outcome::Commit);
        }
        let local_xid = tracker.local_xid();
        let prepared = self.coordinator.prepare_and_decide(tracker).await?;
        match prepared.outcome() {
            Outcome::Commit => {
                self.pending.lock().insert(local_xid, prepared);
                Ok(Outcome::Commit)
            }
            Outcome::Abort => {
                self.coordinator.finalize(prepared).await.into_result()?;
                Ok(Outcome::Abort)
            }
        }
    }

    /// Local transactions decided at pre-commit and awaiting their commit
    /// event.
    pub fn pending_transactions(&self) -> Vec<u64> {
        self.pending.lock().keys().copied().collect()
    }

    /// Periodic housekeeping: heals participants that came back and trims
    /// the decision log.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        self.cache.process_invalidations().await;
        let healed = self.resolver.heal_recovered().await;
        let collected = self.log.collect_garbage(self.config.decision_retention)?;
        Ok(MaintenanceReport { healed, collected })
    }
}

#[async_trait]
impl DistTxnEntryPoints for Extension {
    async fn prepare(&self, tracker: RemoteTxnTracker) -> Result<Outcome> {
        self.pre_commit(tracker).await
    }

    async fn commit_branch(&self, participant: &ParticipantId, gid: &str) -> Result<bool> {
        self.resolver.commit_branch(participant, gid).await
    }

    async fn rollback_branch(&self, participant: &ParticipantId, gid: &str) -> Result<bool> {
        self.resolver.rollback_branch(participant, gid).await
    }

    async fn heal(&self, participant: &ParticipantId) -> Result<HealReport> {
        self.resolver.heal(participant).await
    }

    async fn cache_invalidate(&self, target: Invalidation) {
        self.cache.invalidate(&target).await;
    }
}

/// Everything a host needs to drive distributed transactions.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::connection_cache::*;
    pub use crate::coordinator::*;
    pub use crate::decision::*;
    pub use crate::errors::*;
    pub use crate::executor::*;
    pub use crate::extension::*;
    pub use crate::gid::{CoordinatorId, Gid, GidCodec};
    pub use crate::heal::*;
    pub use crate::isolation::*;
    pub use crate::participant::*;
    pub use crate::tracker::*;
}
