use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{DistTxnError, Result};
use crate::gid::CoordinatorId;

/// Configuration for one coordinator instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identity embedded in every GID this coordinator issues.
    pub coordinator_id: CoordinatorId,
    /// Upper bound for a single participant call (prepare, commit, rollback,
    /// command, in-doubt scan). Exceeding it counts as unreachable.
    pub call_timeout: Duration,
    /// Upper bound for opening a new connection.
    pub connect_timeout: Duration,
    /// Pause after the first failed decision write. It doubles with every
    /// further failure.
    pub decision_write_backoff: Duration,
    /// Ceiling for the pause between decision writes. A failed write is
    /// retried until it succeeds; this only bounds the wait.
    pub decision_write_max_backoff: Duration,
    /// Decision records older than this are garbage collected even if not
    /// every branch was confirmed finalized.
    pub decision_retention: Duration,
    /// Idle connections kept per cache key; surplus is closed on release.
    pub max_idle_per_key: usize,
    /// Location of the durable decision log, when a file backed log is used.
    pub decision_log_path: Option<PathBuf>,
    /// User heal and manual resolution connect as.
    pub maintenance_user: String,
}

impl CoordinatorConfig {
    pub fn new(coordinator_id: CoordinatorId) -> Self {
        Self {
            coordinator_id,
            ..Default::default()
        }
    }

    /// Checks the settings for values the coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(DistTxnError::Config("call_timeout must be non-zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(DistTxnError::Config(
                "connect_timeout must be non-zero".into(),
            ));
        }
        if self.decision_write_backoff.is_zero() {
            return Err(DistTxnError::Config(
                "decision_write_backoff must be non-zero".into(),
            ));
        }
        if self.decision_write_max_backoff < self.decision_write_backoff {
            return Err(DistTxnError::Config(
                "decision_write_max_backoff must not be below decision_write_backoff".into(),
            ));
        }
        if self.max_idle_per_key == 0 {
            return Err(DistTxnError::Config(
                "max_idle_per_key must be at least 1".into(),
            ));
        }
        if self.maintenance_user.is_empty() {
            return Err(DistTxnError::Config(
                "maintenance_user must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordinator_id: CoordinatorId(0),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            decision_write_backoff: Duration::from_millis(50),
            decision_write_max_backoff: Duration::from_secs(5),
            decision_retention: Duration::from_secs(7 * 24 * 3600),
            max_idle_per_key: 4,
            decision_log_path: None,
            maintenance_user: "distxn_maintenance".to_string(),
        }
    }
}
