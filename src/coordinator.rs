//! Two-phase commit across the branches of one local transaction.
//!
//! The protocol runs in two calls so the host can place its own local
//! commit between them:
//!
//! 1. [`TwoPhaseCoordinator::prepare_and_decide`] prepares every branch,
//!    picks the outcome and writes the decision record.
//! 2. [`TwoPhaseCoordinator::finalize`] tells every participant the outcome.
//!
//! [`TwoPhaseCoordinator::commit`] runs both back to back.

use ahash::AHashMap as HashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::decision::{DecisionLog, DecisionRecord, Outcome};
use crate::errors::{DistTxnError, Result};
use crate::gid::{CoordinatorId, Gid};
use crate::participant::ParticipantId;
use crate::tracker::{BranchState, RemoteTxnTracker};

/// What happened to each branch of a finished distributed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub local_xid: u64,
    pub outcome: Outcome,
    pub committed: Vec<ParticipantId>,
    pub rolled_back: Vec<ParticipantId>,
    /// Branches whose participant could not be told the outcome, or whose
    /// prepare timed out. They stay prepared until heal resolves them.
    pub in_doubt: Vec<ParticipantId>,
    pub prepare_failures: Vec<(ParticipantId, DistTxnError)>,
    /// Whether a decision record for this transaction is on stable storage.
    pub decision_durable: bool,
    /// Set when the outcome was forced to abort by the decision step itself.
    pub decision_error: Option<DistTxnError>,
}

impl CommitReport {
    /// Turns an aborted report into the error the caller of a commit sees.
    pub fn into_result(self) -> Result<CommitReport> {
        if self.outcome == Outcome::Commit {
            return Ok(self);
        }
        if let Some(err) = self.decision_error {
            return Err(err);
        }
        Err(DistTxnError::TransactionAborted {
            failed_branches: self.prepare_failures.into_iter().map(|(p, _)| p).collect(),
        })
    }
}

/// Local transactions this coordinator is running the commit protocol for,
/// from their first `PREPARE` until finalize returns.
///
/// Heal consults it so that it never resolves a branch whose outcome the
/// coordinator is still about to decide or deliver.
#[derive(Debug, Default)]
pub struct InFlightTxns {
    xids: Mutex<HashMap<u64, usize>>,
}

impl InFlightTxns {
    pub fn contains(&self, local_xid: u64) -> bool {
        self.xids.lock().contains_key(&local_xid)
    }

    pub fn len(&self) -> usize {
        self.xids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(self: &Arc<Self>, local_xid: u64) -> InFlightGuard {
        *self.xids.lock().entry(local_xid).or_insert(0) += 1;
        InFlightGuard {
            txns: self.clone(),
            local_xid,
        }
    }
}

/// Keeps a transaction registered in [`InFlightTxns`] while alive.
#[derive(Debug)]
struct InFlightGuard {
    txns: Arc<InFlightTxns>,
    local_xid: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut xids = self.txns.xids.lock();
        if let Some(count) = xids.get_mut(&self.local_xid) {
            *count -= 1;
            if *count == 0 {
                xids.remove(&self.local_xid);
            }
        }
    }
}

/// A transaction whose outcome is decided but not yet delivered.
///
/// Its transaction stays in flight, and thus hidden from heal, until it is
/// finalized or dropped.
#[derive(Debug)]
pub struct PreparedTxn {
    tracker: RemoteTxnTracker,
    in_flight: InFlightGuard,
    outcome: Outcome,
    prepare_failures: Vec<(ParticipantId, DistTxnError)>,
    decision_durable: bool,
    decision_error: Option<DistTxnError>,
}

impl PreparedTxn {
    pub fn local_xid(&self) -> u64 {
        self.tracker.local_xid()
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn tracker(&self) -> &RemoteTxnTracker {
        &self.tracker
    }

    /// The tracker stays usable for inspection; cancelling it is refused
    /// once branches are prepared.
    pub fn tracker_mut(&mut self) -> &mut RemoteTxnTracker {
        &mut self.tracker
    }

    pub fn prepare_failures(&self) -> &[(ParticipantId, DistTxnError)] {
        &self.prepare_failures
    }

    /// Gives the branch connections back without finalizing. The branches
    /// stay prepared on their participants.
    pub(crate) async fn release_connections(&mut self) {
        self.tracker.release_connections().await;
    }
}

struct Decision {
    outcome: Outcome,
    durable: bool,
    error: Option<DistTxnError>,
}

/// Drives the commit protocol. Cheap to clone.
#[derive(Clone)]
pub struct TwoPhaseCoordinator {
    coordinator: CoordinatorId,
    log: Arc<dyn DecisionLog>,
    in_flight: Arc<InFlightTxns>,
    call_timeout: Duration,
    write_backoff: Duration,
    max_write_backoff: Duration,
}

impl TwoPhaseCoordinator {
    pub fn new(log: Arc<dyn DecisionLog>, config: &CoordinatorConfig) -> Self {
        Self {
            coordinator: config.coordinator_id,
            log,
            in_flight: Arc::new(InFlightTxns::default()),
            call_timeout: config.call_timeout,
            write_backoff: config.decision_write_backoff,
            max_write_backoff: config.decision_write_max_backoff,
        }
    }

    /// The transactions currently between prepare and finalize.
    pub fn in_flight(&self) -> &Arc<InFlightTxns> {
        &self.in_flight
    }

    /// Prepares, decides and delivers the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DistTxnError::TransactionAborted`] naming the branches that
    /// failed to prepare, or [`DistTxnError::DecisionWriteFailed`] if a commit
    /// decision could not be persisted and an abort was recorded instead.
    /// Either way every reachable branch has been rolled back.
    pub async fn commit(&self, tracker: RemoteTxnTracker) -> Result<CommitReport> {
        let prepared = self.prepare_and_decide(tracker).await?;
        self.finalize(prepared).await.into_result()
    }

    /// Aborts a transaction on behalf of its local side. Branches are
    /// rolled back; an abort record is written first so heal agrees.
    pub async fn abort(&self, mut tracker: RemoteTxnTracker) -> Result<CommitReport> {
        tracker.record_outcome(Outcome::Abort)?;
        let prepared = self.prepare_and_decide(tracker).await?;
        Ok(self.finalize(prepared).await)
    }

    /// Runs the prepare phase and persists the decision.
    ///
    /// The work runs on its own task: once a `PREPARE` has gone out, the
    /// decision must be written even if the caller stops polling.
    pub async fn prepare_and_decide(&self, tracker: RemoteTxnTracker) -> Result<PreparedTxn> {
        let this = self.clone();
        tokio::spawn(async move { this.run_prepare_phase(tracker).await })
            .await
            .map_err(|e| DistTxnError::Internal(format!("prepare task failed: {e}")))
    }

    async fn run_prepare_phase(&self, mut tracker: RemoteTxnTracker) -> PreparedTxn {
        let local_xid = tracker.local_xid();
        let in_flight = self.in_flight.enter(local_xid);
        let local_abort = tracker.outcome() == Some(Outcome::Abort);

        let mut prepare_failures: Vec<(ParticipantId, DistTxnError)> = tracker
            .list_branches()
            .into_iter()
            .filter(|b| b.state() == BranchState::Failed)
            .map(|b| {
                let err = b.error().cloned().unwrap_or_else(|| DistTxnError::RemoteError {
                    participant: b.participant().clone(),
                    reason: "branch failed before prepare".into(),
                });
                (b.participant().clone(), err)
            })
            .collect();

        if !local_abort && prepare_failures.is_empty() {
            let timeout = self.call_timeout;
            let votes = tracker
                .branches_mut()
                .filter(|b| b.state() == BranchState::Open)
                .map(|b| async move {
                    let vote = b.prepare(timeout).await;
                    (b.participant().clone(), vote)
                });
            let votes = join_all(votes).await;
            for (participant, vote) in votes {
                if let Err(e) = vote {
                    warn!("branch on {} failed to prepare: {}", participant, e);
                    tracker.report_unreachable(&e);
                    prepare_failures.push((participant, e));
                }
            }
        }

        let candidate = if !local_abort && prepare_failures.is_empty() {
            Outcome::Commit
        } else {
            Outcome::Abort
        };

        let gids = tracker.gids();
        let mut decision = if gids.is_empty() {
            Decision {
                outcome: candidate,
                durable: false,
                error: None,
            }
        } else {
            self.write_decision(local_xid, gids, candidate).await
        };

        if let Err(e) = tracker.record_outcome(decision.outcome) {
            error!("transaction {}: {}", local_xid, e);
            decision.error.get_or_insert(e);
        }
        info!(
            "transaction {} decided {} ({} branches, {} prepare failures)",
            local_xid,
            decision.outcome,
            tracker.list_branches().len(),
            prepare_failures.len()
        );

        PreparedTxn {
            tracker,
            in_flight,
            outcome: decision.outcome,
            prepare_failures,
            decision_durable: decision.durable,
            decision_error: decision.error,
        }
    }

    /// Writes the decision record, retrying with backoff until some record
    /// is durable.
    ///
    /// A commit decision that cannot be written turns into an abort. A
    /// failed write may still have reached storage, so the log is read back
    /// after each failure and an existing record wins. Giving up would leave
    /// prepared branches without any record, so there is no attempt limit.
    async fn write_decision(&self, local_xid: u64, gids: Vec<Gid>, candidate: Outcome) -> Decision {
        let mut outcome = candidate;
        let mut error = None;
        let mut backoff = self.write_backoff;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let record = DecisionRecord::new(self.coordinator, local_xid, gids.clone(), outcome);
            match self.log.write(&record) {
                Ok(()) => {
                    debug!("decision for transaction {} is durable", local_xid);
                    return Decision {
                        outcome,
                        durable: true,
                        error,
                    };
                }
                Err(e) => {
                    warn!(
                        "decision write for transaction {} failed (attempt {}): {}",
                        local_xid, attempt, e
                    );
                    if let Some(recorded) = self.recorded_outcome(&gids) {
                        info!("transaction {} found recorded as {}", local_xid, recorded);
                        return Decision {
                            outcome: recorded,
                            durable: true,
                            error: if recorded == Outcome::Abort { error } else { None },
                        };
                    }
                    if outcome == Outcome::Commit {
                        error!("transaction {} aborted: commit decision not durable", local_xid);
                        outcome = Outcome::Abort;
                    }
                    error.get_or_insert(DistTxnError::DecisionWriteFailed(e.to_string()));
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(self.max_write_backoff);
        }
    }

    fn recorded_outcome(&self, gids: &[Gid]) -> Option<Outcome> {
        let gid = gids.first()?;
        self.log.lookup(gid).ok().flatten()
    }

    /// Delivers the decided outcome to every branch and releases the
    /// connections. Never fails: unreachable participants are reported as
    /// in doubt.
    pub async fn finalize(&self, prepared: PreparedTxn) -> CommitReport {
        let PreparedTxn {
            mut tracker,
            in_flight,
            outcome,
            prepare_failures,
            decision_durable,
            decision_error,
        } = prepared;
        let local_xid = tracker.local_xid();

        let mut report = CommitReport {
            local_xid,
            outcome,
            committed: Vec::new(),
            rolled_back: Vec::new(),
            in_doubt: Vec::new(),
            prepare_failures,
            decision_durable,
            decision_error,
        };

        let timeout = self.call_timeout;
        let deliveries = tracker
            .branches_mut()
            .filter(|b| matches!(b.state(), BranchState::Open | BranchState::Prepared))
            .map(|b| async move {
                let result = b.finalize(outcome, timeout).await;
                (b.participant().clone(), b.gid(), result)
            });
        let deliveries = join_all(deliveries).await;

        for (participant, gid, result) in deliveries {
            match result {
                Ok(()) => {
                    if decision_durable {
                        self.acknowledge(&gid);
                    }
                    match outcome {
                        Outcome::Commit => report.committed.push(participant),
                        Outcome::Abort => report.rolled_back.push(participant),
                    }
                }
                Err(e) => {
                    warn!("branch {} on {} left in doubt: {}", gid, participant, e);
                    tracker.report_unreachable(&e);
                    report.in_doubt.push(participant);
                }
            }
        }

        // Failed branches. A refused prepare is gone on the participant, and
        // a branch that failed before prepare dies with its session; only a
        // timed out prepare may still be held there.
        for branch in tracker.list_branches() {
            if branch.state() != BranchState::Failed {
                continue;
            }
            match branch.error() {
                Some(DistTxnError::ParticipantUnreachable { .. }) if branch.prepare_sent() => {
                    report.in_doubt.push(branch.participant().clone())
                }
                _ => {
                    if decision_durable {
                        self.acknowledge(&branch.gid());
                    }
                    report.rolled_back.push(branch.participant().clone());
                }
            }
        }

        tracker.release_connections().await;
        drop(in_flight);
        info!(
            "transaction {} finalized {}: {} committed, {} rolled back, {} in doubt",
            local_xid,
            outcome,
            report.committed.len(),
            report.rolled_back.len(),
            report.in_doubt.len()
        );
        report
    }

    fn acknowledge(&self, gid: &Gid) {
        if let Err(e) = self.log.acknowledge(gid) {
            warn!("could not acknowledge {}: {}", gid, e);
        }
    }
}
