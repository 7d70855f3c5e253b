//! Bookkeeping of the remote branches opened by one local transaction.
//!
//! A [`RemoteTxnTracker`] is owned by the local transaction it belongs to.
//! It opens at most one [`Branch`] per participant, hands out the branch
//! GIDs and holds the leased connections until the transaction ends.

use futures::future::join_all;
use log::{debug, error, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::connection_cache::{Connection, ConnectionCache, ConnectionKey};
use crate::decision::Outcome;
use crate::errors::{DistTxnError, Result};
use crate::gid::{CoordinatorId, Gid};
use crate::isolation::IsolationScope;
use crate::participant::{CommandResponse, ParticipantId, TransportError};

/// Position of a branch in the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// Remote transaction started, work may still be sent.
    Open,
    Preparing,
    /// The participant voted yes and holds the branch under its GID.
    Prepared,
    Finalizing,
    Finalized(Outcome),
    /// The branch could not be prepared, or its work failed.
    Failed,
}

impl BranchState {
    /// Whether the protocol allows moving from `self` to `next`.
    ///
    /// A branch that never prepared is rolled back directly from `Open`. A
    /// finalize call that fails moves the branch back to `Prepared`, where
    /// heal will find it.
    pub fn can_transition_to(&self, next: BranchState) -> bool {
        use BranchState::*;
        matches!(
            (*self, next),
            (Open, Preparing)
                | (Open, Failed)
                | (Open, Finalized(Outcome::Abort))
                | (Preparing, Prepared)
                | (Preparing, Failed)
                | (Prepared, Finalizing)
                | (Finalizing, Finalized(_))
                | (Finalizing, Prepared)
        )
    }

    /// Whether the participant may hold this branch as a prepared transaction.
    pub fn is_prepared(&self) -> bool {
        matches!(
            self,
            BranchState::Preparing | BranchState::Prepared | BranchState::Finalizing
        )
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchState::Open => write!(f, "open"),
            BranchState::Preparing => write!(f, "preparing"),
            BranchState::Prepared => write!(f, "prepared"),
            BranchState::Finalizing => write!(f, "finalizing"),
            BranchState::Finalized(outcome) => write!(f, "finalized({outcome})"),
            BranchState::Failed => write!(f, "failed"),
        }
    }
}

/// One remote transaction on one participant.
#[derive(Debug)]
pub struct Branch {
    participant: ParticipantId,
    gid: Gid,
    state: BranchState,
    connection: Option<Connection>,
    error: Option<DistTxnError>,
    prepare_sent: bool,
}

impl Branch {
    fn new(participant: ParticipantId, gid: Gid, connection: Connection) -> Self {
        Self {
            participant,
            gid,
            state: BranchState::Open,
            connection: Some(connection),
            error: None,
            prepare_sent: false,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn state(&self) -> BranchState {
        self.state
    }

    /// The failure that moved the branch to [`BranchState::Failed`].
    pub fn error(&self) -> Option<&DistTxnError> {
        self.error.as_ref()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Whether `PREPARE` went out for this branch, so the participant may
    /// hold it even if the branch failed.
    pub fn prepare_sent(&self) -> bool {
        self.prepare_sent
    }

    pub(crate) fn transition(&mut self, next: BranchState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DistTxnError::InvalidBranchTransition {
                participant: self.participant.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!("branch {} on {}: {} -> {}", self.gid, self.participant, self.state, next);
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, error: DistTxnError) -> DistTxnError {
        if self.state.can_transition_to(BranchState::Failed) {
            self.state = BranchState::Failed;
        }
        self.error = Some(error.clone());
        error
    }

    fn connection_mut(&mut self) -> std::result::Result<&mut Connection, TransportError> {
        self.connection
            .as_mut()
            .ok_or_else(|| TransportError::Unreachable("branch connection already released".into()))
    }

    /// Runs a command inside the branch. Any failure fails the branch, since
    /// the participant aborts its transaction on error.
    pub(crate) async fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandResponse> {
        if self.state != BranchState::Open {
            return Err(DistTxnError::InvalidBranchTransition {
                participant: self.participant.clone(),
                from: self.state,
                to: BranchState::Open,
            });
        }
        let result = match self.connection_mut() {
            Ok(conn) => remote_call!(conn, timeout, execute(command)),
            Err(e) => Err(e),
        };
        result.map_err(|e| {
            let err = e.into_error(&self.participant);
            self.fail(err)
        })
    }

    pub(crate) async fn prepare(&mut self, timeout: Duration) -> Result<()> {
        self.transition(BranchState::Preparing)?;
        self.prepare_sent = true;
        let gid = self.gid.encode();
        let result = match self.connection_mut() {
            Ok(conn) => remote_call!(conn, timeout, prepare(&gid)),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.transition(BranchState::Prepared),
            Err(e) => {
                let err = e.into_error(&self.participant);
                Err(self.fail(err))
            }
        }
    }

    /// Brings the branch to `outcome` on its participant.
    ///
    /// Prepared branches are finalized with `COMMIT PREPARED` or
    /// `ROLLBACK PREPARED`. A participant that no longer holds the GID has
    /// nothing left to roll back; for a commit it means somebody else
    /// resolved the branch, so it stays prepared and the call fails. Open
    /// branches can only be rolled back.
    pub(crate) async fn finalize(&mut self, outcome: Outcome, timeout: Duration) -> Result<()> {
        match self.state {
            BranchState::Finalized(done) if done == outcome => Ok(()),
            BranchState::Open => {
                if !self.state.can_transition_to(BranchState::Finalized(outcome)) {
                    return self.transition(BranchState::Finalized(outcome));
                }
                let result = match self.connection_mut() {
                    Ok(conn) => remote_call!(conn, timeout, rollback()),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => self.transition(BranchState::Finalized(outcome)),
                    // The participant drops the transaction with the session.
                    Err(e) => {
                        let err = e.into_error(&self.participant);
                        Err(self.fail(err))
                    }
                }
            }
            _ => {
                self.transition(BranchState::Finalizing)?;
                let gid = self.gid.encode();
                let result = match self.connection_mut() {
                    Ok(conn) => match outcome {
                        Outcome::Commit => remote_call!(conn, timeout, commit_prepared(&gid)),
                        Outcome::Abort => remote_call!(conn, timeout, rollback_prepared(&gid)),
                    },
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => self.transition(BranchState::Finalized(outcome)),
                    Err(TransportError::NoSuchTransaction(_)) if outcome == Outcome::Abort => {
                        warn!(
                            "participant {} no longer holds {}, treating as {}",
                            self.participant, gid, outcome
                        );
                        self.transition(BranchState::Finalized(outcome))
                    }
                    Err(e) => {
                        if matches!(e, TransportError::NoSuchTransaction(_)) {
                            error!(
                                "participant {} lost {} before it was committed",
                                self.participant, gid
                            );
                        }
                        self.transition(BranchState::Prepared)?;
                        Err(e.into_error(&self.participant))
                    }
                }
            }
        }
    }
}

/// Remote branches of one local transaction.
pub struct RemoteTxnTracker {
    local_xid: u64,
    user: String,
    isolation: IsolationScope,
    coordinator: CoordinatorId,
    cache: Arc<ConnectionCache>,
    call_timeout: Duration,
    branches: BTreeMap<ParticipantId, Branch>,
    outcome: Option<Outcome>,
    next_seq: u32,
}

impl RemoteTxnTracker {
    pub fn new(
        local_xid: u64,
        user: impl Into<String>,
        isolation: IsolationScope,
        cache: Arc<ConnectionCache>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            local_xid,
            user: user.into(),
            isolation,
            coordinator: config.coordinator_id,
            cache,
            call_timeout: config.call_timeout,
            branches: BTreeMap::new(),
            outcome: None,
            next_seq: 0,
        }
    }

    pub fn local_xid(&self) -> u64 {
        self.local_xid
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn isolation(&self) -> IsolationScope {
        self.isolation
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Returns the branch on `participant`, starting it if this transaction
    /// has none there yet.
    pub async fn open_branch(&mut self, participant: &ParticipantId) -> Result<&mut Branch> {
        if !self.branches.contains_key(participant) {
            let (key, gid) = self.next_branch(participant);
            let branch = start_branch(&self.cache, key, gid, self.call_timeout).await?;
            self.branches.insert(participant.clone(), branch);
        }
        self.branches
            .get_mut(participant)
            .ok_or_else(|| DistTxnError::UnknownParticipant(participant.clone()))
    }

    /// Opens branches on several participants concurrently. Participants
    /// that already have a branch are reported as opened.
    pub async fn open_branches(
        &mut self,
        participants: &[ParticipantId],
    ) -> BTreeMap<ParticipantId, Result<()>> {
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();
        let wanted: BTreeSet<&ParticipantId> = participants.iter().collect();
        for participant in wanted {
            if self.branches.contains_key(participant) {
                results.insert(participant.clone(), Ok(()));
            } else {
                let (key, gid) = self.next_branch(participant);
                pending.push((key, gid));
            }
        }

        let cache = &self.cache;
        let timeout = self.call_timeout;
        let started = join_all(pending.into_iter().map(|(key, gid)| async move {
            let participant = key.participant.clone();
            (participant, start_branch(cache, key, gid, timeout).await)
        }))
        .await;

        for (participant, result) in started {
            match result {
                Ok(branch) => {
                    self.branches.insert(participant.clone(), branch);
                    results.insert(participant, Ok(()));
                }
                Err(e) => {
                    results.insert(participant, Err(e));
                }
            }
        }
        results
    }

    fn next_branch(&mut self, participant: &ParticipantId) -> (ConnectionKey, Gid) {
        let seq = self.next_seq;
        self.next_seq += 1;
        (
            ConnectionKey::new(participant.clone(), self.user.clone(), self.isolation),
            Gid::new(self.coordinator, self.local_xid, seq),
        )
    }

    /// Every branch, in participant order.
    pub fn list_branches(&self) -> Vec<&Branch> {
        self.branches.values().collect()
    }

    pub fn branch(&self, participant: &ParticipantId) -> Option<&Branch> {
        self.branches.get(participant)
    }

    pub fn branch_mut(&mut self, participant: &ParticipantId) -> Option<&mut Branch> {
        self.branches.get_mut(participant)
    }

    pub(crate) fn branches_mut(&mut self) -> impl Iterator<Item = &mut Branch> {
        self.branches.values_mut()
    }

    pub fn gids(&self) -> Vec<Gid> {
        self.branches.values().map(|b| b.gid).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Sets the terminal outcome. Setting the same value again is a no-op.
    pub fn record_outcome(&mut self, outcome: Outcome) -> Result<()> {
        match self.outcome {
            Some(current) if current == outcome => Ok(()),
            Some(current) => Err(DistTxnError::OutcomeAlreadySet {
                current,
                requested: outcome,
            }),
            None => {
                self.outcome = Some(outcome);
                Ok(())
            }
        }
    }

    /// Feeds an unreachable participant back into the cache health state.
    pub(crate) fn report_unreachable(&self, error: &DistTxnError) {
        if let DistTxnError::ParticipantUnreachable { participant, .. } = error {
            self.cache.mark_unreachable(participant);
        }
    }

    /// Hands every branch connection back to the cache. Sessions of
    /// branches that did not finish cleanly are closed rather than reused.
    pub async fn release_connections(&mut self) {
        let conns: Vec<Connection> = self
            .branches
            .values_mut()
            .filter_map(|b| {
                let mut conn = b.connection.take()?;
                if !matches!(b.state, BranchState::Finalized(_)) {
                    conn.mark_broken();
                }
                Some(conn)
            })
            .collect();
        for conn in conns {
            self.cache.release(conn).await;
        }
    }

    /// Cancels the transaction before commit: rolls back every open branch
    /// and releases the connections.
    ///
    /// Refused once any branch has been sent `PREPARE`; from then on only
    /// the commit protocol may end the transaction.
    pub async fn discard(&mut self) -> Result<()> {
        if self.branches.values().any(|b| b.state.is_prepared()) {
            return Err(DistTxnError::CancelAfterPrepare {
                local_xid: self.local_xid,
            });
        }
        self.record_outcome(Outcome::Abort)?;

        let timeout = self.call_timeout;
        let rollbacks = self
            .branches
            .values_mut()
            .filter(|b| b.state == BranchState::Open)
            .map(|b| b.finalize(Outcome::Abort, timeout));
        let results = join_all(rollbacks).await;
        for result in results {
            if let Err(e) = result {
                warn!("rollback of cancelled transaction {} failed: {}", self.local_xid, e);
                self.report_unreachable(&e);
            }
        }
        self.release_connections().await;
        Ok(())
    }
}

impl fmt::Debug for RemoteTxnTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTxnTracker")
            .field("local_xid", &self.local_xid)
            .field("user", &self.user)
            .field("isolation", &self.isolation)
            .field("branches", &self.branches)
            .field("outcome", &self.outcome)
            .finish()
    }
}

async fn start_branch(
    cache: &ConnectionCache,
    key: ConnectionKey,
    gid: Gid,
    timeout: Duration,
) -> Result<Branch> {
    let mut conn = cache.acquire(&key).await?;
    match remote_call!(conn, timeout, begin(key.scope)) {
        Ok(()) => {
            debug!("branch {} started on {}", gid, key.participant);
            Ok(Branch::new(key.participant, gid, conn))
        }
        Err(e) => {
            if e.breaks_session() {
                cache.mark_unreachable(&key.participant);
            }
            cache.release(conn).await;
            Err(e.into_error(&key.participant))
        }
    }
}
