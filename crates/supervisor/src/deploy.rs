#![forbid(unsafe_code)]
//! Artifact deployment and rollback: the supervisor's only mutations of
//! the active binary path, all funneled through the atomic symlink swap.

use autonous_storage::{Artifact, ArtifactStatus, Store, EVENT_ROLLBACK_ATTEMPTED};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;

type BoxError = Box<dyn std::error::Error>;

/// Point `active_bin` at `new_bin` atomically: symlink to a `.tmp` name,
/// then rename over the active path. A failed step removes the temp link.
pub fn atomic_switch_symlink(active_bin: &Path, new_bin: &Path) -> std::io::Result<()> {
    if !active_bin.is_absolute() || !new_bin.is_absolute() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "active/new path must be absolute",
        ));
    }
    if let Some(dir) = active_bin.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp_link = active_bin.as_os_str().to_os_string();
    tmp_link.push(".tmp");
    let tmp_link = Path::new(&tmp_link);
    let _ = std::fs::remove_file(tmp_link);
    #[cfg(unix)]
    std::os::unix::fs::symlink(new_bin, tmp_link)?;
    #[cfg(not(unix))]
    return Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlink swap requires a unix platform",
    ));
    #[cfg(unix)]
    if let Err(err) = std::fs::rename(tmp_link, active_bin) {
        let _ = std::fs::remove_file(tmp_link);
        return Err(err);
    }
    Ok(())
}

pub fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Claim the oldest approved artifact and make it the active binary.
/// Digest verification happens before the swap; any failure parks the row
/// in `deploy_failed` with a reason-tagged event.
pub fn deploy_approved_artifact(
    cfg: &SupervisorConfig,
    store: &mut Store,
    sup_event_id: i64,
) -> Result<(), BoxError> {
    let Some(artifact) = store.claim_approved_for_deploy()? else {
        return Ok(());
    };
    let _ = store.log_event(
        Some(sup_event_id),
        "update.deploy.started",
        Some(&json!({
            "tx_id": artifact.tx_id,
            "bin_path": artifact.bin_path,
            "target_bin": cfg.worker_bin,
        })),
    );

    if let Some(expected) = artifact.sha256.as_deref().filter(|s| !s.trim().is_empty()) {
        let actual = match file_sha256_hex(Path::new(&artifact.bin_path)) {
            Ok(sum) => sum,
            Err(err) => {
                let message = err.to_string();
                let _ = store.mark_deploy_failed(&artifact.tx_id, &message);
                let _ = store.log_event(
                    Some(sup_event_id),
                    "update.deploy.failed",
                    Some(&json!({
                        "tx_id": artifact.tx_id,
                        "error": message,
                        "reason": "sha256_read",
                    })),
                );
                return Err(err.into());
            }
        };
        if !actual.eq_ignore_ascii_case(expected) {
            let message = format!("sha256 mismatch: got={actual} want={expected}");
            let _ = store.mark_deploy_failed(&artifact.tx_id, &message);
            let _ = store.log_event(
                Some(sup_event_id),
                "update.deploy.failed",
                Some(&json!({
                    "tx_id": artifact.tx_id,
                    "error": message,
                    "reason": "sha256_mismatch",
                })),
            );
            return Err(message.into());
        }
    }

    if let Err(err) =
        atomic_switch_symlink(Path::new(&cfg.worker_bin), Path::new(&artifact.bin_path))
    {
        let message = err.to_string();
        let _ = store.mark_deploy_failed(&artifact.tx_id, &message);
        let _ = store.log_event(
            Some(sup_event_id),
            "update.deploy.failed",
            Some(&json!({
                "tx_id": artifact.tx_id,
                "error": message,
                "reason": "switch_symlink",
            })),
        );
        return Err(err.into());
    }

    if !store.mark_deploy_completed(&artifact.tx_id)? {
        return Err(format!("failed to mark deployed_unstable for tx_id={}", artifact.tx_id).into());
    }
    let _ = store.log_event(
        Some(sup_event_id),
        "update.deploy.completed",
        Some(&json!({"tx_id": artifact.tx_id})),
    );
    Ok(())
}

/// Promote the newest `deployed_unstable` artifact, if any.
pub fn promote_latest_deployed(store: &Store, sup_event_id: i64) -> Result<(), BoxError> {
    let Some(artifact) = store.latest_artifact_by_status(ArtifactStatus::DeployedUnstable)? else {
        return Ok(());
    };
    if !store.mark_promoted(&artifact.tx_id)? {
        return Ok(());
    }
    let _ = store.log_event(
        Some(sup_event_id),
        "update.promoted",
        Some(&json!({
            "tx_id": artifact.tx_id,
            "base_tx_id": artifact.base_tx_id.clone().unwrap_or_default(),
        })),
    );
    Ok(())
}

fn swap_back_to_base(
    cfg: &SupervisorConfig,
    store: &Store,
    sup_event_id: i64,
    artifact: &Artifact,
    base_tx_id: &str,
) -> Result<bool, BoxError> {
    let base = store.get_artifact(base_tx_id)?;
    if let Err(err) = atomic_switch_symlink(Path::new(&cfg.worker_bin), Path::new(&base.bin_path)) {
        let _ = store.log_event(
            Some(sup_event_id),
            EVENT_ROLLBACK_ATTEMPTED,
            Some(&json!({
                "target_tx_id": base_tx_id,
                "success": false,
                "error": err.to_string(),
            })),
        );
        return Err(err.into());
    }
    if !store.mark_rolled_back(&artifact.tx_id)? {
        return Ok(false);
    }
    let _ = store.log_event(
        Some(sup_event_id),
        EVENT_ROLLBACK_ATTEMPTED,
        Some(&json!({"target_tx_id": base_tx_id, "success": true})),
    );
    let _ = store.log_event(
        Some(sup_event_id),
        "update.rollback.completed",
        Some(&json!({"tx_id": artifact.tx_id, "base_tx_id": base_tx_id})),
    );
    Ok(true)
}

/// Roll the newest `deployed_unstable` artifact back to its base. Returns
/// whether a rollback actually happened; no base means nothing to do.
pub fn attempt_artifact_rollback(
    cfg: &SupervisorConfig,
    store: &Store,
    sup_event_id: i64,
) -> Result<bool, BoxError> {
    let Some(artifact) = store.latest_artifact_by_status(ArtifactStatus::DeployedUnstable)? else {
        return Ok(false);
    };
    let Some(base_tx_id) = artifact
        .base_tx_id
        .clone()
        .filter(|base| !base.trim().is_empty())
    else {
        return Ok(false);
    };
    if !store.mark_rollback_pending(&artifact.tx_id)? {
        return Ok(false);
    }
    swap_back_to_base(cfg, store, sup_event_id, &artifact, &base_tx_id)
}

/// Finish a rollback whose intent was recorded but interrupted before the
/// swap completed.
pub fn process_pending_rollback(
    cfg: &SupervisorConfig,
    store: &Store,
    sup_event_id: i64,
) -> Result<bool, BoxError> {
    let Some(artifact) = store.latest_artifact_by_status(ArtifactStatus::RollbackPending)? else {
        return Ok(false);
    };
    let Some(base_tx_id) = artifact
        .base_tx_id
        .clone()
        .filter(|base| !base.trim().is_empty())
    else {
        return Ok(false);
    };
    swap_back_to_base(cfg, store, sup_event_id, &artifact, &base_tx_id)
}

/// Make sure rollback always has a target: on first start, record the
/// currently active binary as the promoted `bootstrap` artifact.
pub fn ensure_bootstrap_artifact(
    cfg: &SupervisorConfig,
    store: &Store,
    sup_event_id: i64,
) -> Result<(), BoxError> {
    if store.latest_promoted_tx_id()?.is_some() {
        return Ok(());
    }
    let mut bin_path = std::path::PathBuf::from(&cfg.worker_bin);
    if let Ok(resolved) = std::fs::canonicalize(&bin_path) {
        bin_path = resolved;
    }
    if bin_path.as_os_str().is_empty() {
        return Err("empty worker bin for bootstrap artifact".into());
    }
    if !bin_path.exists() {
        return Err(format!("bootstrap binary missing at {}", bin_path.display()).into());
    }
    store.ensure_bootstrap_promoted("bootstrap", &bin_path.to_string_lossy())?;
    let _ = store.log_event(
        Some(sup_event_id),
        "update.promoted",
        Some(&json!({"tx_id": "bootstrap", "base_tx_id": ""})),
    );
    Ok(())
}

/// Cooperative timer that promotes the latest `deployed_unstable` artifact
/// once the worker has stayed up for `stable_after`. The exit flag makes
/// the watcher a no-op when the worker died first.
pub fn start_auto_promote_watcher(
    db_path: std::path::PathBuf,
    sup_event_id: i64,
    started_at: Instant,
    stable_after: Duration,
    worker_exited: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let stable_after = if stable_after.is_zero() {
        Duration::from_secs(30)
    } else {
        stable_after
    };
    std::thread::spawn(move || {
        std::thread::sleep(stable_after);
        if worker_exited.load(Ordering::SeqCst) {
            return;
        }
        if started_at.elapsed() < stable_after {
            return;
        }
        let store = match Store::open(&db_path) {
            Ok(store) => store,
            Err(err) => {
                eprintln!("[supervisor] auto promote open store failed: {err}");
                return;
            }
        };
        if let Err(err) = promote_latest_deployed(&store, sup_event_id) {
            eprintln!("[supervisor] auto promote failed: {err}");
        }
    })
}
