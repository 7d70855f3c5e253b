use thiserror::Error;

use crate::decision::Outcome;
use crate::participant::ParticipantId;
use crate::tracker::BranchState;

/// Errors raised by the distributed transaction layer.
///
/// Participant-level failures are always tagged with the participant they
/// came from so callers can aggregate them per branch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistTxnError {
    /// The participant could not be reached, or a call to it timed out.
    /// Retryable; forces an abort only when it happens during prepare.
    #[error("participant {participant} unreachable: {reason}")]
    ParticipantUnreachable {
        participant: ParticipantId,
        reason: String,
    },

    /// The participant answered but refused the command.
    #[error("participant {participant} rejected command: {reason}")]
    RemoteError {
        participant: ParticipantId,
        reason: String,
    },

    /// A GID string that is not one of ours, or is corrupted.
    #[error("malformed gid: {0}")]
    MalformedGid(String),

    #[error("outcome already set to {current}, refusing {requested}")]
    OutcomeAlreadySet { current: Outcome, requested: Outcome },

    /// The durability layer could not persist a decision record.
    #[error("decision write failed: {0}")]
    DecisionWriteFailed(String),

    /// The distributed transaction ended in abort. Lists the participants
    /// whose branches failed to prepare.
    #[error("distributed transaction aborted, failed branches: {failed_branches:?}")]
    TransactionAborted { failed_branches: Vec<ParticipantId> },

    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("illegal branch transition on {participant}: {from} -> {to}")]
    InvalidBranchTransition {
        participant: ParticipantId,
        from: BranchState,
        to: BranchState,
    },

    /// Cancellation was requested after at least one branch started preparing.
    #[error("cannot cancel transaction {local_xid}: branches already prepared")]
    CancelAfterPrepare { local_xid: u64 },

    /// A manual finalize contradicts the recorded decision for the GID.
    #[error("decision for {gid} is {recorded:?}, refusing {requested}")]
    DecisionMismatch {
        gid: String,
        recorded: Option<Outcome>,
        requested: Outcome,
    },

    /// A manual finalize named a branch whose transaction this coordinator
    /// is still running.
    #[error("transaction of {0} is still in progress on this coordinator")]
    TransactionInProgress(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background task of the coordinator died.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DistTxnError {
    /// Participant this error originated from, if any.
    pub fn participant(&self) -> Option<&ParticipantId> {
        match self {
            DistTxnError::ParticipantUnreachable { participant, .. }
            | DistTxnError::RemoteError { participant, .. }
            | DistTxnError::InvalidBranchTransition { participant, .. } => Some(participant),
            DistTxnError::UnknownParticipant(participant) => Some(participant),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DistTxnError::ParticipantUnreachable { .. } | DistTxnError::DecisionWriteFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DistTxnError>;
