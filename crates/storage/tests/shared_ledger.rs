#![forbid(unsafe_code)]
//! Cross-connection behavior: the supervisor and worker each open their
//! own connection to the same ledger file; the status columns are the only
//! coordination between them.

use autonous_storage::{ArtifactStatus, Store};
use autonous_core::Policy;
use serde_json::json;

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[test]
fn two_connections_share_events_and_inbox() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let db_path = dir.path().join("agent.db");
    let supervisor = Store::open(&db_path).expect("open supervisor side");
    let mut worker = Store::open(&db_path).expect("open worker side");

    let sup_id = supervisor
        .log_event(None, "process.started", Some(&json!({"role": "supervisor"})))
        .expect("supervisor root");
    let worker_id = worker
        .log_event(Some(sup_id), "process.started", Some(&json!({"role": "worker"})))
        .expect("worker root");

    // The supervisor's subtree sees the worker's rows immediately.
    let rows = supervisor.subtree(sup_id).expect("subtree");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].id, worker_id);

    // Inbox dedup holds across connections.
    assert!(worker.enqueue_message(500, 1, "hello", 0).unwrap());
    assert!(!supervisor.enqueue_message(500, 1, "hello again", 0).unwrap());
    assert_eq!(supervisor.derive_offset().unwrap(), 501);

    let task = worker
        .claim_next_task(&Policy::default(), unix_now())
        .unwrap()
        .expect("claimable task");
    assert_eq!(task.update_id, 500);
}

#[test]
fn only_one_connection_claims_a_deploy() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let db_path = dir.path().join("agent.db");
    let mut first = Store::open(&db_path).expect("open first");
    let mut second = Store::open(&db_path).expect("open second");

    first
        .insert_artifact("tx-race", "", "/state/artifacts/tx-race/worker", ArtifactStatus::Approved)
        .expect("insert");

    let claimed_first = first.claim_approved_for_deploy().expect("first claim");
    let claimed_second = second.claim_approved_for_deploy().expect("second claim");

    assert!(claimed_first.is_some());
    assert!(claimed_second.is_none(), "the deploying row must have one owner");
    assert_eq!(
        first.get_artifact("tx-race").unwrap().status(),
        Some(ArtifactStatus::Deploying)
    );
}

#[test]
fn transition_race_loser_sees_no_row_affected() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let db_path = dir.path().join("agent.db");
    let writer_a = Store::open(&db_path).expect("open a");
    let writer_b = Store::open(&db_path).expect("open b");

    writer_a
        .insert_artifact("tx-once", "", "/a", ArtifactStatus::DeployedUnstable)
        .expect("insert");

    let a_won = writer_a.mark_promoted("tx-once").expect("a transition");
    let b_won = writer_b.mark_promoted("tx-once").expect("b transition");
    assert!(a_won);
    assert!(!b_won, "losing a conditional transition is not an error");
}
