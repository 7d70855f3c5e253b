//! Resolution of prepared branches left behind by interrupted transactions.
//!
//! A participant keeps a prepared branch until it is told the outcome. If
//! the coordinator crashed or lost the participant between prepare and
//! finalize, the branch stays in doubt. Heal scans a participant for
//! prepared transactions issued by this coordinator and finalizes each one
//! according to the decision log. A GID without a decision record is rolled
//! back: the coordinator never got as far as deciding, so it cannot have
//! told anybody to commit.
//!
//! Transactions this coordinator is still committing are skipped: their
//! decision may not be written yet, and the coordinator delivers it itself.
//!
//! Heal is idempotent. Running it twice over the same participant changes
//! nothing the second time.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::connection_cache::{Connection, ConnectionCache, ConnectionKey};
use crate::coordinator::InFlightTxns;
use crate::decision::{DecisionLog, Outcome};
use crate::errors::{DistTxnError, Result};
use crate::gid::{Gid, GidCodec};
use crate::isolation::IsolationScope;
use crate::participant::{ParticipantId, TransportError, TransportResult};

/// Result of one heal pass over one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealReport {
    pub participant: ParticipantId,
    /// Prepared transactions the participant reported, of any coordinator.
    pub scanned: usize,
    /// Prepared transactions of other coordinators, left alone.
    pub foreign: usize,
    /// Strings carrying our prefix that did not decode.
    pub malformed: Vec<String>,
    /// Our GIDs whose transaction is still between prepare and finalize.
    pub in_progress: Vec<Gid>,
    pub committed: Vec<Gid>,
    pub rolled_back: Vec<Gid>,
    /// GIDs the participant no longer held by the time we finalized them.
    pub already_resolved: Vec<Gid>,
    pub failures: Vec<(Gid, DistTxnError)>,
}

impl HealReport {
    fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            scanned: 0,
            foreign: 0,
            malformed: Vec::new(),
            in_progress: Vec::new(),
            committed: Vec::new(),
            rolled_back: Vec::new(),
            already_resolved: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Number of branches this pass finalized.
    pub fn changes(&self) -> usize {
        self.committed.len() + self.rolled_back.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Running totals over every heal pass of a resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealStats {
    pub runs: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub already_resolved: u64,
    /// Foreign, malformed and in-progress GIDs passed over.
    pub skipped: u64,
    pub failures: u64,
}

pub struct Resolver {
    cache: Arc<ConnectionCache>,
    log: Arc<dyn DecisionLog>,
    in_flight: Arc<InFlightTxns>,
    codec: GidCodec,
    user: String,
    call_timeout: Duration,
    stats: Mutex<HealStats>,
}

impl Resolver {
    pub fn new(
        cache: Arc<ConnectionCache>,
        log: Arc<dyn DecisionLog>,
        in_flight: Arc<InFlightTxns>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            cache,
            log,
            in_flight,
            codec: GidCodec::new(config.coordinator_id),
            user: config.maintenance_user.clone(),
            call_timeout: config.call_timeout,
            stats: Mutex::new(HealStats::default()),
        }
    }

    pub fn stats(&self) -> HealStats {
        *self.stats.lock()
    }

    /// Finalizes every in-doubt branch of this coordinator on `participant`.
    ///
    /// # Errors
    ///
    /// Fails only if the participant cannot be reached or listed. Problems
    /// with individual GIDs are reported in [`HealReport::failures`].
    pub async fn heal(&self, participant: &ParticipantId) -> Result<HealReport> {
        let mut conn = self.maintenance_connection(participant).await?;
        let result = self.heal_on(&mut conn, participant).await;
        self.cache.release(conn).await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.note_failure(&e);
                return Err(e);
            }
        };
        for (_, e) in &report.failures {
            self.note_failure(e);
        }

        {
            let mut stats = self.stats.lock();
            stats.runs += 1;
            stats.committed += report.committed.len() as u64;
            stats.rolled_back += report.rolled_back.len() as u64;
            stats.already_resolved += report.already_resolved.len() as u64;
            stats.skipped += (report.foreign + report.malformed.len() + report.in_progress.len()) as u64;
            stats.failures += report.failures.len() as u64;
        }
        info!(
            "heal of {}: {} scanned, {} committed, {} rolled back, {} failed",
            participant,
            report.scanned,
            report.committed.len(),
            report.rolled_back.len(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn heal_on(&self, conn: &mut Connection, participant: &ParticipantId) -> Result<HealReport> {
        let timeout = self.call_timeout;
        let listed = remote_call!(conn, timeout, list_in_doubt())
            .map_err(|e| e.into_error(participant))?;

        let mut report = HealReport::new(participant.clone());
        report.scanned = listed.len();

        for raw in listed {
            if !self.codec.owns(&raw) {
                report.foreign += 1;
                continue;
            }
            let gid = match self.codec.decode(&raw) {
                Ok(gid) => gid,
                Err(e) => {
                    warn!("skipping in-doubt transaction on {}: {}", participant, e);
                    report.malformed.push(raw);
                    continue;
                }
            };
            if self.in_flight.contains(gid.local_xid) {
                debug!("{} on {} belongs to a running transaction", gid, participant);
                report.in_progress.push(gid);
                continue;
            }
            // A lookup error is not an absent record; leave the GID alone.
            let outcome = match self.log.lookup(&gid) {
                Ok(recorded) => recorded.unwrap_or(Outcome::Abort),
                Err(e) => {
                    report.failures.push((gid, e));
                    continue;
                }
            };

            match finalize_gid(conn, &raw, outcome, timeout).await {
                Ok(changed) => {
                    self.acknowledge(&gid);
                    if !changed {
                        debug!("{} already resolved on {}", gid, participant);
                        report.already_resolved.push(gid);
                    } else if outcome == Outcome::Commit {
                        report.committed.push(gid);
                    } else {
                        report.rolled_back.push(gid);
                    }
                }
                Err(e) => {
                    let broken = e.breaks_session();
                    report.failures.push((gid, e.into_error(participant)));
                    if broken {
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Heals every participant that came back since the last call.
    pub async fn heal_recovered(&self) -> Vec<(ParticipantId, Result<HealReport>)> {
        let mut reports = Vec::new();
        for participant in self.cache.take_recovered() {
            let report = self.heal(&participant).await;
            reports.push((participant, report));
        }
        reports
    }

    /// Commits one prepared branch by hand. Allowed only when the decision
    /// log records a commit for it and its transaction is not running.
    ///
    /// Returns whether the participant still held the branch.
    pub async fn commit_branch(&self, participant: &ParticipantId, gid: &str) -> Result<bool> {
        self.resolve_branch(participant, gid, Outcome::Commit).await
    }

    /// Rolls back one prepared branch by hand. Refused when the decision
    /// log records a commit for it.
    pub async fn rollback_branch(&self, participant: &ParticipantId, gid: &str) -> Result<bool> {
        self.resolve_branch(participant, gid, Outcome::Abort).await
    }

    async fn resolve_branch(&self, participant: &ParticipantId, raw: &str, requested: Outcome) -> Result<bool> {
        let gid = self.codec.decode(raw)?;
        if self.in_flight.contains(gid.local_xid) {
            return Err(DistTxnError::TransactionInProgress(raw.to_string()));
        }
        let recorded = self.log.lookup(&gid)?;
        let allowed = match requested {
            Outcome::Commit => recorded == Some(Outcome::Commit),
            Outcome::Abort => recorded != Some(Outcome::Commit),
        };
        if !allowed {
            return Err(DistTxnError::DecisionMismatch {
                gid: raw.to_string(),
                recorded,
                requested,
            });
        }

        let mut conn = self.maintenance_connection(participant).await?;
        let result = finalize_gid(&mut conn, raw, requested, self.call_timeout).await;
        self.cache.release(conn).await;

        let changed = result.map_err(|e| {
            let err = e.into_error(participant);
            self.note_failure(&err);
            err
        })?;
        self.acknowledge(&gid);

        let mut stats = self.stats.lock();
        match (changed, requested) {
            (false, _) => stats.already_resolved += 1,
            (true, Outcome::Commit) => stats.committed += 1,
            (true, Outcome::Abort) => stats.rolled_back += 1,
        }
        info!("{} on {} finalized by hand: {}", raw, participant, requested);
        Ok(changed)
    }

    async fn maintenance_connection(&self, participant: &ParticipantId) -> Result<Connection> {
        let key = ConnectionKey::new(participant.clone(), self.user.clone(), IsolationScope::Maintenance);
        self.cache.acquire(&key).await
    }

    fn note_failure(&self, error: &DistTxnError) {
        if let DistTxnError::ParticipantUnreachable { participant, .. } = error {
            self.cache.mark_unreachable(participant);
        }
    }

    fn acknowledge(&self, gid: &Gid) {
        if let Err(e) = self.log.acknowledge(gid) {
            warn!("could not acknowledge {}: {}", gid, e);
        }
    }
}

/// Sends the outcome for one prepared GID. `Ok(false)` means the
/// participant did not hold it any more.
async fn finalize_gid(
    conn: &mut Connection,
    gid: &str,
    outcome: Outcome,
    timeout: Duration,
) -> TransportResult<bool> {
    let result = match outcome {
        Outcome::Commit => remote_call!(conn, timeout, commit_prepared(gid)),
        Outcome::Abort => remote_call!(conn, timeout, rollback_prepared(gid)),
    };
    match result {
        Ok(()) => Ok(true),
        Err(TransportError::NoSuchTransaction(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
