use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::DistTxnError;
use crate::isolation::IsolationScope;

/// Name of a remote data node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Connection parameters of a participant, as provided by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Reference into the host's credential store; never the secret itself.
    pub credentials_ref: Option<String>,
}

impl ParticipantInfo {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            id: ParticipantId::new(id),
            host: host.into(),
            port,
            database: database.into(),
            credentials_ref: None,
        }
    }
}

/// Reachability of a participant as last observed by the connection cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthState {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// Failures reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network failure, closed session or similar; the session is unusable.
    Unreachable(String),
    /// The participant holds no prepared transaction under the given GID.
    NoSuchTransaction(String),
    /// The participant processed the request and refused it.
    Rejected(String),
}

impl TransportError {
    /// Maps a transport failure into the crate error taxonomy.
    pub fn into_error(self, participant: &ParticipantId) -> DistTxnError {
        match self {
            TransportError::Unreachable(reason) => DistTxnError::ParticipantUnreachable {
                participant: participant.clone(),
                reason,
            },
            TransportError::NoSuchTransaction(gid) => DistTxnError::RemoteError {
                participant: participant.clone(),
                reason: format!("no prepared transaction {gid}"),
            },
            TransportError::Rejected(reason) => DistTxnError::RemoteError {
                participant: participant.clone(),
                reason,
            },
        }
    }

    /// Whether the session that produced this error must be discarded.
    pub fn breaks_session(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            TransportError::NoSuchTransaction(gid) => write!(f, "no such transaction: {gid}"),
            TransportError::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result of running a command on one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    /// Command completion tag, e.g. `INSERT 0 3`.
    pub status: String,
    pub rows: Vec<Vec<String>>,
}

/// One live session to a participant.
///
/// The coordinator depends only on `prepare`, `commit_prepared`,
/// `rollback_prepared` and `list_in_doubt`; the remaining methods carry the
/// work done inside a branch before it is prepared.
#[async_trait]
pub trait RemoteSession: Send {
    /// Starts a remote transaction at the given isolation on this session.
    async fn begin(&mut self, isolation: IsolationScope) -> TransportResult<()>;

    /// Runs a command inside the current remote transaction, or in
    /// autocommit mode when none is open.
    async fn execute(&mut self, command: &str) -> TransportResult<CommandResponse>;

    /// Rolls back an open, not yet prepared, remote transaction.
    async fn rollback(&mut self) -> TransportResult<()>;

    /// Prepares the open remote transaction under `gid`.
    async fn prepare(&mut self, gid: &str) -> TransportResult<()>;

    async fn commit_prepared(&mut self, gid: &str) -> TransportResult<()>;

    async fn rollback_prepared(&mut self, gid: &str) -> TransportResult<()>;

    /// Every prepared transaction the participant holds, of any coordinator.
    async fn list_in_doubt(&mut self) -> TransportResult<Vec<String>>;

    /// Cheap local check; must not perform I/O.
    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&mut self) {}
}

/// Opens sessions to participants.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, participant: &ParticipantInfo, user: &str) -> TransportResult<Box<dyn RemoteSession>>;
}

/// Source of participant connection parameters.
pub trait ParticipantRegistry: Send + Sync {
    fn lookup(&self, id: &ParticipantId) -> Option<ParticipantInfo>;

    fn participants(&self) -> Vec<ParticipantId>;
}

/// Registry backed by an in-memory map; the host keeps it in sync with its
/// catalog.
#[derive(Default)]
pub struct StaticRegistry {
    participants: RwLock<HashMap<ParticipantId, ParticipantInfo>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_participants(infos: impl IntoIterator<Item = ParticipantInfo>) -> Self {
        let registry = Self::new();
        for info in infos {
            registry.add(info);
        }
        registry
    }

    pub fn add(&self, info: ParticipantInfo) {
        self.participants.write().insert(info.id.clone(), info);
    }

    pub fn remove(&self, id: &ParticipantId) -> Option<ParticipantInfo> {
        self.participants.write().remove(id)
    }
}

impl ParticipantRegistry for StaticRegistry {
    fn lookup(&self, id: &ParticipantId) -> Option<ParticipantInfo> {
        self.participants.read().get(id).cloned()
    }

    fn participants(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.participants.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
