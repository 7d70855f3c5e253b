//! Durable record of the outcome chosen for each distributed transaction.
//!
//! A decision record is written once, after every branch has voted and
//! before any participant is told to finalize. It is what lets the heal
//! procedure complete an interrupted transaction after a crash: a GID found
//! in-doubt on a participant is committed only if a record says `Commit`,
//! and rolled back otherwise (including when no record exists at all).
//!
//! Records are immutable. Finalization of individual branches is tracked
//! with separate acknowledgement entries, and a garbage collection sweep
//! removes a record once all of its GIDs are acknowledged or once it is
//! older than the configured retention.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::Result;
use crate::gid::{CoordinatorId, Gid};

/// This module holds the in-memory decision log.
pub mod memory;
/// This module holds the RocksDB backed decision log.
#[cfg(feature = "rocksdb-store")]
pub mod rocks;

pub use memory::MemoryDecisionLog;
#[cfg(feature = "rocksdb-store")]
pub use rocks::RocksDecisionLog;

/// Terminal outcome of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Commit,
    Abort,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Commit => write!(f, "commit"),
            Outcome::Abort => write!(f, "abort"),
        }
    }
}

/// The durable decision for one local transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub coordinator: CoordinatorId,
    pub local_xid: u64,
    /// Every branch the decision applies to.
    pub gids: Vec<Gid>,
    pub outcome: Outcome,
    /// Wall-clock time of the write, ms since epoch.
    pub written_at_ms: u64,
}

impl DecisionRecord {
    pub fn new(coordinator: CoordinatorId, local_xid: u64, gids: Vec<Gid>, outcome: Outcome) -> Self {
        Self {
            coordinator,
            local_xid,
            gids,
            outcome,
            written_at_ms: now_ms(),
        }
    }

    /// Whether the record is past the retention window at `now_ms`.
    pub fn expired(&self, retention: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.written_at_ms) >= retention.as_millis() as u64
    }
}

/// Durable store of decision records.
///
/// Implementations must have the record on stable storage before `write`
/// returns `Ok`. Writing a record for a transaction that already has one is
/// accepted only if the outcome is the same; records are never changed.
pub trait DecisionLog: Send + Sync {
    fn write(&self, record: &DecisionRecord) -> Result<()>;

    /// The recorded outcome for the transaction a GID belongs to.
    fn lookup(&self, gid: &Gid) -> Result<Option<Outcome>>;

    /// Notes that the branch named by `gid` is finalized on its participant.
    fn acknowledge(&self, gid: &Gid) -> Result<()>;

    fn records(&self) -> Result<Vec<DecisionRecord>>;

    /// Deletes records whose GIDs are all acknowledged, or that are older
    /// than `retention`. Returns how many records were removed.
    fn collect_garbage(&self, retention: Duration) -> Result<usize>;
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
