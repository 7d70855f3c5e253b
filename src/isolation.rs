use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation scope of a cached connection.
///
/// Remote transactions are started at the isolation level of the local
/// transaction that opened them. A session that has run a transaction at
/// one level is only reused for the same level, so the scope is part of the
/// connection cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum IsolationScope {
    /// **Read Committed:** each remote statement sees data committed before
    /// it began.
    ReadCommitted,
    /// **Repeatable Read:** every statement of the remote transaction sees
    /// the snapshot taken at its first statement. This is the level used
    /// for remote branches unless the local transaction is serializable,
    /// because a branch spans several statements of one local transaction.
    #[default]
    RepeatableRead,
    /// **Serializable:** as repeatable read, plus the participant aborts
    /// transactions whose concurrent execution is not serializable.
    Serializable,
    /// Sessions used outside any remote transaction, e.g. for heal scans and
    /// manual resolution of prepared branches.
    Maintenance,
}

impl fmt::Display for IsolationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationScope::ReadCommitted => "read-committed",
            IsolationScope::RepeatableRead => "repeatable-read",
            IsolationScope::Serializable => "serializable",
            IsolationScope::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}
