#![forbid(unsafe_code)]
//! Staging pipeline: build, test and self-check a candidate worker binary,
//! driving the artifact row created -> building -> testing -> self_checking
//! -> staged. Any step failure parks the row in the matching failed state.

use autonous_storage::{ArtifactStatus, Store, StoreError};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use crate::config::WorkerConfig;
use crate::error::WorkerError;

#[derive(Debug)]
pub enum StageOutcome {
    Staged { tx_id: String, bin_path: PathBuf },
    Duplicate,
    Failed { step: &'static str, error: String },
}

pub fn stage_artifact(
    store: &mut Store,
    cfg: &WorkerConfig,
    worker_event_id: i64,
    tx_id: &str,
) -> Result<StageOutcome, WorkerError> {
    let tx_id = tx_id.trim();
    if tx_id.is_empty() || !tx_id.chars().all(is_tx_id_char) {
        return Ok(StageOutcome::Failed {
            step: "validate",
            error: format!("invalid tx_id: {tx_id:?}"),
        });
    }
    match store.get_artifact(tx_id) {
        Ok(_) => return Ok(StageOutcome::Duplicate),
        Err(StoreError::NotFound { .. }) => {}
        Err(err) => return Err(err.into()),
    }

    let base_tx_id = store.latest_promoted_tx_id()?.unwrap_or_default();
    let bin_dir = Path::new(&cfg.update_artifact_root).join(tx_id);
    let bin_path = bin_dir.join("worker");
    store.insert_artifact_with_event(
        Some(worker_event_id),
        tx_id,
        &base_tx_id,
        &bin_path.to_string_lossy(),
        ArtifactStatus::Created,
        "update.txn.created",
        &json!({"tx_id": tx_id, "base_tx_id": base_tx_id, "bin_path": bin_path.to_string_lossy()}),
    )?;

    let deadline = Instant::now() + Duration::from_secs(cfg.update_pipeline_timeout_seconds);

    // Build.
    store.transition_artifact(tx_id, ArtifactStatus::Created, ArtifactStatus::Building, "")?;
    if let Err(error) = build_step(store, cfg, tx_id, &bin_dir, &bin_path, deadline) {
        store.transition_artifact(tx_id, ArtifactStatus::Building, ArtifactStatus::BuildFailed, &error)?;
        return Ok(StageOutcome::Failed {
            step: "build",
            error,
        });
    }

    // Test.
    store.transition_artifact(tx_id, ArtifactStatus::Building, ArtifactStatus::Testing, "")?;
    match command_step(cfg, &cfg.update_test_cmd, deadline) {
        Ok(summary) => store.set_artifact_test_summary(tx_id, &summary.to_string())?,
        Err(error) => {
            store.transition_artifact(tx_id, ArtifactStatus::Testing, ArtifactStatus::TestFailed, &error)?;
            return Ok(StageOutcome::Failed {
                step: "test",
                error,
            });
        }
    }

    // Self-check; an empty command is recorded as skipped.
    store.transition_artifact(tx_id, ArtifactStatus::Testing, ArtifactStatus::SelfChecking, "")?;
    if cfg.update_self_check_cmd.trim().is_empty() {
        store.set_artifact_self_check_summary(tx_id, &json!({"self_check": "skipped"}).to_string())?;
    } else {
        match command_step(cfg, &cfg.update_self_check_cmd, deadline) {
            Ok(summary) => store.set_artifact_self_check_summary(tx_id, &summary.to_string())?,
            Err(error) => {
                store.transition_artifact(
                    tx_id,
                    ArtifactStatus::SelfChecking,
                    ArtifactStatus::SelfCheckFailed,
                    &error,
                )?;
                return Ok(StageOutcome::Failed {
                    step: "self_check",
                    error,
                });
            }
        }
    }

    store.transition_artifact_with_event(
        Some(worker_event_id),
        tx_id,
        ArtifactStatus::SelfChecking,
        ArtifactStatus::Staged,
        "",
        "update.staged",
        &json!({"tx_id": tx_id, "base_tx_id": base_tx_id}),
    )?;

    Ok(StageOutcome::Staged {
        tx_id: tx_id.to_string(),
        bin_path,
    })
}

fn is_tx_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Run the build command in the workspace, then copy the produced binary
/// into the artifact directory and record its digest and revision.
fn build_step(
    store: &Store,
    cfg: &WorkerConfig,
    tx_id: &str,
    bin_dir: &Path,
    bin_path: &Path,
    deadline: Instant,
) -> Result<(), String> {
    run_shell(&cfg.update_build_cmd, &cfg.workspace_dir, deadline)
        .map_err(|err| format!("build command failed: {err}"))?;

    let built = Path::new(&cfg.workspace_dir).join(&cfg.update_build_artifact);
    std::fs::create_dir_all(bin_dir)
        .map_err(|err| format!("create artifact dir {}: {err}", bin_dir.display()))?;
    std::fs::copy(&built, bin_path)
        .map_err(|err| format!("copy built binary {}: {err}", built.display()))?;

    let sha = file_sha256_hex(bin_path).map_err(|err| format!("hash binary: {err}"))?;
    let revision = git_head_rev(&cfg.workspace_dir);
    store
        .set_artifact_build_metadata(tx_id, &sha, &revision)
        .map_err(|err| format!("record build metadata: {err}"))?;
    Ok(())
}

fn command_step(
    cfg: &WorkerConfig,
    command: &str,
    deadline: Instant,
) -> Result<serde_json::Value, String> {
    run_shell(command, &cfg.workspace_dir, deadline)?;
    Ok(json!({"command": command, "ok": true}))
}

/// `bash -lc <command>` in `workdir`, bounded by the pipeline deadline.
fn run_shell(command: &str, workdir: &str, deadline: Instant) -> Result<(), String> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err("update pipeline timeout exhausted".to_string());
    }
    let mut child = Command::new("bash")
        .args(["-lc", command])
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| format!("spawn {command:?}: {err}"))?;
    match child
        .wait_timeout(remaining)
        .map_err(|err| format!("wait {command:?}: {err}"))?
    {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(format!(
            "{command:?} exit status {}",
            status.code().unwrap_or(-1)
        )),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(format!("{command:?} timed out"))
        }
    }
}

pub fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn git_head_rev(workspace_dir: &str) -> String {
    let Ok(output) = Command::new("git")
        .args(["-C", workspace_dir, "rev-parse", "HEAD"])
        .output()
    else {
        return String::new();
    };
    if !output.status.success() {
        return String::new();
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
