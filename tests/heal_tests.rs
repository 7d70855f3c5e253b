mod common;

use common::*;
use distxn::prelude::*;
use std::sync::Arc;

fn record(log: &MemoryDecisionLog, local_xid: u64, outcome: Outcome) -> Gid {
    let gid = Gid::new(COORDINATOR, local_xid, 0);
    log.write(&DecisionRecord::new(COORDINATOR, local_xid, vec![gid], outcome))
        .unwrap();
    gid
}

#[tokio::test]
async fn heal_is_idempotent() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a"], log.clone());

    let mut commits = Vec::new();
    let mut aborts = Vec::new();
    for xid in 1..=6u64 {
        let gid = Gid::new(COORDINATOR, xid, 0);
        h.cluster.inject_prepared("a", &gid.encode());
        match xid % 3 {
            0 => commits.push(record(&log, xid, Outcome::Commit)),
            1 => aborts.push(record(&log, xid, Outcome::Abort)),
            // No record at all.
            _ => aborts.push(gid),
        }
    }

    let first = h.ext.resolver().heal(&pid("a")).await.unwrap();
    assert_eq!(first.scanned, 6);
    assert_eq!(first.changes(), 6);
    assert_eq!(first.committed, commits);
    let mut rolled_back = first.rolled_back.clone();
    rolled_back.sort();
    aborts.sort();
    assert_eq!(rolled_back, aborts);
    assert!(first.is_complete());

    let second = h.ext.resolver().heal(&pid("a")).await.unwrap();
    assert_eq!(second.scanned, 0);
    assert_eq!(second.changes(), 0);
    assert_eq!(h.cluster.committed("a").len(), 2);
    assert_eq!(h.cluster.rolled_back("a").len(), 4);
}

#[tokio::test]
async fn missing_record_means_abort() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a", "b"], log.clone());

    // The coordinator prepared both branches and crashed before deciding.
    let a_gid = h.gid(40, 0);
    let b_gid = h.gid(40, 1);
    h.cluster.inject_prepared("a", &a_gid);
    h.cluster.inject_prepared("b", &b_gid);

    for name in ["a", "b"] {
        let report = h.ext.resolver().heal(&pid(name)).await.unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        assert!(report.committed.is_empty());
    }
    assert_eq!(h.cluster.rolled_back("a"), vec![a_gid]);
    assert_eq!(h.cluster.rolled_back("b"), vec![b_gid]);
}

#[tokio::test]
async fn crash_between_prepare_and_decision() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a", "b"], log.clone());
    let tracker = h.begin_with_work(41, &["a", "b"]).await;

    // Prepared and decided, then the record is lost together with the
    // process before any participant heard the outcome.
    let prepared = h.ext.coordinator().prepare_and_decide(tracker).await.unwrap();
    assert_eq!(prepared.outcome(), Outcome::Commit);
    log.forget(COORDINATOR, 41).unwrap();
    drop(prepared);

    for name in ["a", "b"] {
        let report = h.ext.resolver().heal(&pid(name)).await.unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        assert!(h.cluster.committed(name).is_empty());
        assert!(h.cluster.prepared(name).is_empty());
    }
}

#[tokio::test]
async fn foreign_and_malformed_gids_are_left_alone() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a"], log.clone());
    let other = GidCodec::new(CoordinatorId(0x99)).encode(1, 0);
    let garbage = format!("{}not-a-gid", GidCodec::new(COORDINATOR).prefix());
    h.cluster.inject_prepared("a", &other);
    h.cluster.inject_prepared("a", "pg_internal_xact");
    h.cluster.inject_prepared("a", &garbage);
    h.cluster.inject_prepared("a", &h.gid(42, 0));

    let report = h.ext.resolver().heal(&pid("a")).await.unwrap();

    assert_eq!(report.scanned, 4);
    assert_eq!(report.foreign, 2);
    assert_eq!(report.malformed, vec![garbage.clone()]);
    assert_eq!(report.rolled_back.len(), 1);
    let mut left = h.cluster.prepared("a");
    left.sort();
    let mut expected = vec![other, "pg_internal_xact".to_string(), garbage];
    expected.sort();
    assert_eq!(left, expected);
}

#[tokio::test]
async fn unreachable_participant_fails_heal() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a"], log);
    h.cluster.set_reachable("a", false);

    let err = h.ext.resolver().heal(&pid("a")).await.unwrap_err();

    assert!(matches!(err, DistTxnError::ParticipantUnreachable { .. }));
    assert_eq!(h.ext.cache().health(&pid("a")), HealthState::Unreachable);
}

#[tokio::test]
async fn recovered_participants_are_healed() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a", "b"], log.clone());
    let committed = record(&log, 43, Outcome::Commit);
    h.cluster.inject_prepared("b", &committed.encode());

    h.cluster.set_reachable("b", false);
    assert!(h.ext.resolver().heal(&pid("b")).await.is_err());

    // New work reaches b again, which queues it for heal.
    h.cluster.set_reachable("b", true);
    let tracker = h.begin_with_work(44, &["b"]).await;
    h.ext.coordinator().commit(tracker).await.unwrap();

    let maintenance = h.ext.run_maintenance().await.unwrap();
    assert_eq!(maintenance.healed.len(), 1);
    let (participant, report) = &maintenance.healed[0];
    assert_eq!(participant, &pid("b"));
    assert_eq!(report.as_ref().unwrap().committed, vec![committed]);
    assert_eq!(h.cluster.committed("b").len(), 2);

    // Nothing new came back.
    assert!(h.ext.run_maintenance().await.unwrap().healed.is_empty());
}

#[tokio::test]
async fn manual_resolution_follows_the_decision_log() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a"], log.clone());
    let committed = record(&log, 45, Outcome::Commit);
    let undecided = h.gid(46, 0);
    h.cluster.inject_prepared("a", &committed.encode());
    h.cluster.inject_prepared("a", &undecided);

    let refused = h.ext.rollback_branch(&pid("a"), &committed.encode()).await;
    assert!(matches!(refused, Err(DistTxnError::DecisionMismatch { .. })));
    let refused = h.ext.commit_branch(&pid("a"), &undecided).await;
    assert!(matches!(
        refused,
        Err(DistTxnError::DecisionMismatch { recorded: None, .. })
    ));

    assert!(h.ext.commit_branch(&pid("a"), &committed.encode()).await.unwrap());
    assert!(h.ext.rollback_branch(&pid("a"), &undecided).await.unwrap());
    // Already gone: a no-op, not an error.
    assert!(!h.ext.rollback_branch(&pid("a"), &undecided).await.unwrap());

    assert!(h.cluster.prepared("a").is_empty());
    let stats = h.ext.heal_stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(stats.already_resolved, 1);
}

#[tokio::test]
async fn stats_accumulate_across_runs() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a"], log.clone());
    h.cluster.inject_prepared("a", &h.gid(47, 0));
    h.cluster
        .inject_prepared("a", &GidCodec::new(CoordinatorId(1)).encode(1, 0));

    h.ext.resolver().heal(&pid("a")).await.unwrap();
    h.ext.resolver().heal(&pid("a")).await.unwrap();

    let stats = h.ext.heal_stats();
    assert_eq!(stats.runs, 2);
    assert_eq!(stats.rolled_back, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.failures, 0);
}

#[tokio::test]
async fn heal_acknowledges_finalized_gids() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a"], log.clone());
    let gid = record(&log, 48, Outcome::Commit);
    h.cluster.inject_prepared("a", &gid.encode());

    h.ext.resolver().heal(&pid("a")).await.unwrap();

    assert_eq!(log.collect_garbage(std::time::Duration::from_secs(3600)).unwrap(), 1);
    assert!(log.is_empty());
}

#[tokio::test]
async fn heal_leaves_running_transactions_alone() {
    let log = Arc::new(MemoryDecisionLog::new());
    let h = harness(&["a", "b"], log.clone());
    // a is prepared at once; b holds the decision back.
    h.cluster.stall_prepare("b", std::time::Duration::from_millis(150));
    let tracker = h.begin_with_work(60, &["a", "b"]).await;
    let a_gid = tracker.gids()[0];

    let coordinator = h.ext.coordinator().clone();
    let commit = tokio::spawn(async move { coordinator.commit(tracker).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(h.cluster.prepared("a"), vec![h.gid(60, 0)]);
    let report = h.ext.resolver().heal(&pid("a")).await.unwrap();
    assert_eq!(report.in_progress, vec![a_gid]);
    assert!(report.rolled_back.is_empty());
    let refused = h.ext.rollback_branch(&pid("a"), &h.gid(60, 0)).await;
    assert!(matches!(refused, Err(DistTxnError::TransactionInProgress(_))));

    let committed = commit.await.unwrap().unwrap();
    assert_eq!(committed.committed, pids(&["a", "b"]));
    assert_eq!(h.cluster.committed("a"), vec![h.gid(60, 0)]);
    assert!(h.cluster.rolled_back("a").is_empty());
    assert!(h.ext.coordinator().in_flight().is_empty());
    assert_eq!(h.ext.heal_stats().skipped, 1);
}
