//! Distributed transactions over remote data nodes.
//!
//! A coordinator process runs local transactions that also write to remote
//! participants. Each participant gets one remote branch per local
//! transaction; at commit the branches are prepared, the outcome is written
//! to a durable decision log and then delivered to every participant.
//! Branches whose participant was unreachable when the outcome was sent are
//! resolved later by heal.
//!
//! Start with [`Extension`], or pull in [`prelude`].

/// Awaits a session call bounded by a timeout and folds the result through
/// [`connection_cache::Connection::settle`].
macro_rules! remote_call {
    ($conn:ident, $timeout:expr, $method:ident($($arg:expr),*)) => {{
        let timeout = $timeout;
        let outcome = tokio::time::timeout(timeout, $conn.session().$method($($arg),*)).await;
        $conn.settle(outcome, timeout)
    }};
}

pub mod config;
pub mod connection_cache;
pub mod coordinator;
pub mod decision;
pub mod errors;
pub mod executor;
pub mod extension;
pub mod gid;
pub mod heal;
pub mod isolation;
pub mod participant;
pub mod tracker;

// Re-export key types for easier access
pub use config::CoordinatorConfig;
pub use connection_cache::{invalidation_channel, Connection, ConnectionCache, ConnectionKey, Invalidation, InvalidationNotifier};
pub use coordinator::{CommitReport, PreparedTxn, TwoPhaseCoordinator};
pub use decision::{DecisionLog, DecisionRecord, MemoryDecisionLog, Outcome};
#[cfg(feature = "rocksdb-store")]
pub use decision::RocksDecisionLog;
pub use errors::{DistTxnError, Result};
pub use executor::{CommandExecutor, Dispatch, ExecMode, ExecutionResult};
pub use extension::{prelude, DistTxnEntryPoints, Extension, LocalTxnEvent, MaintenanceReport};
pub use gid::{CoordinatorId, Gid, GidCodec};
pub use heal::{HealReport, HealStats, Resolver};
pub use isolation::IsolationScope;
pub use participant::{
    CommandResponse, Connector, HealthState, ParticipantId, ParticipantInfo, ParticipantRegistry, RemoteSession,
    StaticRegistry, TransportError, TransportResult,
};
pub use tracker::{Branch, BranchState, RemoteTxnTracker};
