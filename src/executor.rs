//! Fan-out of one command to the branches of a transaction.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::errors::Result;
use crate::participant::{CommandResponse, ParticipantId};
use crate::tracker::RemoteTxnTracker;

/// How failures of individual participants are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// The first error (in participant order) is returned as the error of
    /// the whole call.
    #[default]
    FailFast,
    /// Every participant is attempted and reported individually.
    CollectAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Send to every participant before awaiting any reply.
    #[default]
    Parallel,
    /// One participant at a time, in participant order.
    Sequential,
}

/// Per participant outcome of a fan-out.
pub type ExecutionResult = BTreeMap<ParticipantId, Result<CommandResponse>>;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    call_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            call_timeout: config.call_timeout,
        }
    }

    /// Runs `command` inside the branch of every listed participant,
    /// opening branches as needed.
    ///
    /// A participant that fails has its branch marked failed, which forces
    /// the transaction to abort at commit time.
    pub async fn execute(
        &self,
        tracker: &mut RemoteTxnTracker,
        participants: &[ParticipantId],
        command: &str,
        mode: ExecMode,
        dispatch: Dispatch,
    ) -> Result<ExecutionResult> {
        let targets: BTreeSet<ParticipantId> = participants.iter().cloned().collect();
        let results = match dispatch {
            Dispatch::Sequential => self.run_sequential(tracker, &targets, command, mode).await,
            Dispatch::Parallel => self.run_parallel(tracker, &targets, command).await,
        };

        for err in results.values().filter_map(|r| r.as_ref().err()) {
            tracker.report_unreachable(err);
        }
        if mode == ExecMode::FailFast {
            if let Some(err) = results.values().find_map(|r| r.as_ref().err()) {
                return Err(err.clone());
            }
        }
        Ok(results)
    }

    async fn run_sequential(
        &self,
        tracker: &mut RemoteTxnTracker,
        targets: &BTreeSet<ParticipantId>,
        command: &str,
        mode: ExecMode,
    ) -> ExecutionResult {
        let mut results = BTreeMap::new();
        for participant in targets {
            let result = match tracker.open_branch(participant).await {
                Ok(branch) => branch.execute(command, self.call_timeout).await,
                Err(e) => Err(e),
            };
            let failed = result.is_err();
            results.insert(participant.clone(), result);
            if failed && mode == ExecMode::FailFast {
                break;
            }
        }
        results
    }

    async fn run_parallel(
        &self,
        tracker: &mut RemoteTxnTracker,
        targets: &BTreeSet<ParticipantId>,
        command: &str,
    ) -> ExecutionResult {
        let wanted: Vec<ParticipantId> = targets.iter().cloned().collect();
        let mut results = BTreeMap::new();
        for (participant, opened) in tracker.open_branches(&wanted).await {
            if let Err(e) = opened {
                results.insert(participant, Err(e));
            }
        }

        let skip: BTreeSet<ParticipantId> = results.keys().cloned().collect();
        let timeout = self.call_timeout;
        let sends = tracker
            .branches_mut()
            .filter(|b| targets.contains(b.participant()) && !skip.contains(b.participant()))
            .map(|b| async move {
                let result = b.execute(command, timeout).await;
                (b.participant().clone(), result)
            });
        let replies = join_all(sends).await;
        results.extend(replies);
        results
    }
}
