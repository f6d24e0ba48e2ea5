#![forbid(unsafe_code)]
//! Direct operator commands intercepted before agent dispatch:
//! `update stage <tx>`, `approve <tx>`, `cancel <tx>`, `update status`.
//! Handled commands bypass the model, the breaker and the retry machinery.

use autonous_storage::{ArtifactStatus, InboxTask, Store};
use serde_json::json;

use crate::commander::Commander;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::update::{stage_artifact, StageOutcome};

/// Result of the direct-command check. When `handled` is false the task
/// belongs to the agent.
#[derive(Debug, Default)]
pub struct DirectCommandOutcome {
    pub handled: bool,
    pub reply: String,
    pub should_exit: bool,
}

impl DirectCommandOutcome {
    fn unhandled() -> Self {
        Self::default()
    }

    fn reply(text: impl Into<String>) -> Self {
        Self {
            handled: true,
            reply: text.into(),
            should_exit: false,
        }
    }
}

pub fn process_direct_command(
    store: &mut Store,
    commander: &mut dyn Commander,
    cfg: &WorkerConfig,
    task: &InboxTask,
    worker_event_id: i64,
) -> Result<DirectCommandOutcome, WorkerError> {
    let tokens: Vec<&str> = task.text.split_whitespace().collect();
    match tokens.as_slice() {
        ["approve", tx_id] => approve(store, task, worker_event_id, tx_id),
        ["cancel", tx_id] => cancel(store, worker_event_id, tx_id),
        ["update", "stage", tx_id] => stage(store, commander, cfg, task, worker_event_id, tx_id),
        ["update", "status"] => status(store),
        _ => Ok(DirectCommandOutcome::unhandled()),
    }
}

/// `staged -> approved`, stamping the approving chat. On success the worker
/// exits cleanly so the supervisor's next iteration performs the deploy.
fn approve(
    store: &mut Store,
    task: &InboxTask,
    worker_event_id: i64,
    tx_id: &str,
) -> Result<DirectCommandOutcome, WorkerError> {
    let approved = store.approve_artifact_with_event(Some(worker_event_id), tx_id, task.chat_id)?;
    if !approved {
        return Ok(DirectCommandOutcome::reply(format!(
            "approve ignored: tx_id={tx_id} is not staged"
        )));
    }
    Ok(DirectCommandOutcome {
        handled: true,
        reply: format!("approve ok: tx_id={tx_id}; worker restarting to deploy"),
        should_exit: true,
    })
}

fn cancel(
    store: &mut Store,
    worker_event_id: i64,
    tx_id: &str,
) -> Result<DirectCommandOutcome, WorkerError> {
    let cancelled = store.transition_artifact_with_event(
        Some(worker_event_id),
        tx_id,
        ArtifactStatus::Staged,
        ArtifactStatus::Cancelled,
        "",
        "update.cancelled",
        &json!({"tx_id": tx_id}),
    )?;
    if !cancelled {
        return Ok(DirectCommandOutcome::reply(format!(
            "cancel ignored: tx_id={tx_id} is not staged"
        )));
    }
    Ok(DirectCommandOutcome::reply(format!("cancel ok: tx_id={tx_id}")))
}

/// Run the staging pipeline. On success the approval request itself
/// reports the outcome, so the ordinary reply stays empty.
fn stage(
    store: &mut Store,
    commander: &mut dyn Commander,
    cfg: &WorkerConfig,
    task: &InboxTask,
    worker_event_id: i64,
    tx_id: &str,
) -> Result<DirectCommandOutcome, WorkerError> {
    match stage_artifact(store, cfg, worker_event_id, tx_id)? {
        StageOutcome::Staged { tx_id, .. } => {
            let text = format!(
                "update stage ok: tx_id={tx_id} staged; reply 'approve {tx_id}' to deploy or 'cancel {tx_id}' to drop"
            );
            if let Err(err) = commander.send_approval_request(task.chat_id, &text, &tx_id) {
                // The artifact is staged either way; the operator can still
                // approve by id.
                return Ok(DirectCommandOutcome::reply(format!(
                    "update stage ok: tx_id={tx_id} staged (approval notify failed: {err})"
                )));
            }
            Ok(DirectCommandOutcome::reply(""))
        }
        StageOutcome::Duplicate => Ok(DirectCommandOutcome::reply(format!(
            "update stage ignored: tx_id={tx_id} already exists"
        ))),
        StageOutcome::Failed { step, error } => Ok(DirectCommandOutcome::reply(format!(
            "update stage failed: {step}: {error}"
        ))),
    }
}

fn status(store: &mut Store) -> Result<DirectCommandOutcome, WorkerError> {
    let mut lines = Vec::new();
    for status in [
        ArtifactStatus::Staged,
        ArtifactStatus::Approved,
        ArtifactStatus::DeployedUnstable,
        ArtifactStatus::Promoted,
    ] {
        match store.latest_artifact_by_status(status)? {
            Some(artifact) => lines.push(format!(
                "{}: tx_id={} updated_at={}",
                status, artifact.tx_id, artifact.updated_at
            )),
            None => lines.push(format!("{status}: none")),
        }
    }
    Ok(DirectCommandOutcome::reply(lines.join("\n")))
}
