#![forbid(unsafe_code)]
//! autonous supervisor: keeps exactly one worker running, watches for
//! crash loops, deploys approved artifacts and rolls back unstable ones.

mod config;
mod deploy;

use autonous_storage::{
    Store, EVENT_CRASH_LOOP_DETECTED, EVENT_PROCESS_STARTED, EVENT_REVISION_PROMOTED,
    EVENT_ROLLBACK_ATTEMPTED, EVENT_WORKER_EXITED, EVENT_WORKER_SPAWNED,
};
use serde_json::json;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::SupervisorConfig;
use deploy::{
    attempt_artifact_rollback, deploy_approved_artifact, ensure_bootstrap_artifact,
    process_pending_rollback, promote_latest_deployed, start_auto_promote_watcher,
};

fn log_line(message: &str) {
    eprintln!("[supervisor] {message}");
}

fn fatal(message: &str) -> ! {
    log_line(message);
    std::process::exit(1);
}

fn main() {
    let cfg = SupervisorConfig::from_env();
    let mut store = match Store::open(&cfg.state_db_path) {
        Ok(store) => store,
        Err(err) => fatal(&format!("failed to open store: {err}")),
    };

    let sup_event_id = match store.log_event(
        None,
        EVENT_PROCESS_STARTED,
        Some(&json!({
            "role": "supervisor",
            "pid": std::process::id(),
            "version": git_head_rev(&cfg.workspace_dir),
        })),
    ) {
        Ok(id) => id,
        Err(err) => fatal(&format!("failed to log process.started: {err}")),
    };

    if let Err(err) = ensure_bootstrap_artifact(&cfg, &store, sup_event_id) {
        log_line(&format!("bootstrap artifact init failed: {err}"));
    }

    match store.cleanup_in_progress() {
        Ok(0) => {}
        Ok(cleaned) => {
            log_line(&format!("startup cleanup updated {cleaned} in-progress artifacts"));
            let _ = store.log_event(
                Some(sup_event_id),
                "update.cleanup.completed",
                Some(&json!({"affected_rows": cleaned})),
            );
        }
        Err(err) => log_line(&format!("startup cleanup failed: {err}")),
    }

    // Seed the good-revision marker on a fresh ledger.
    let head_rev = git_head_rev(&cfg.workspace_dir);
    if !head_rev.is_empty() {
        if let Ok(None) = store.current_good_rev() {
            let _ = store.log_event(
                Some(sup_event_id),
                EVENT_REVISION_PROMOTED,
                Some(&json!({"revision": head_rev})),
            );
            log_line(&format!("initialized current_good_rev={head_rev}"));
        }
    }

    let mut crash_times: Vec<Instant> = Vec::new();
    log_line(&format!("running worker={}", cfg.worker_bin));

    loop {
        match process_pending_rollback(&cfg, &store, sup_event_id) {
            Ok(true) => log_line("finished pending rollback"),
            Ok(false) => {}
            Err(err) => log_line(&format!("pending rollback failed: {err}")),
        }
        if let Err(err) = deploy_approved_artifact(&cfg, &mut store, sup_event_id) {
            log_line(&format!("deploy approved artifact failed: {err}"));
        }

        let seq = match store.next_worker_seq(sup_event_id) {
            Ok(seq) => seq,
            Err(err) => fatal(&format!("failed to get worker seq: {err}")),
        };
        let instance_id = format!("W{seq:06}");
        let started_at = Instant::now();

        log_line(&format!("starting worker instance {instance_id}"));
        let mut child = match Command::new(&cfg.worker_bin)
            .env("WORKER_INSTANCE_ID", &instance_id)
            .env("PARENT_PROCESS_ID", sup_event_id.to_string())
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => fatal(&format!(
                "failed to start worker binary {}: {err}",
                cfg.worker_bin
            )),
        };

        let worker_exited = Arc::new(AtomicBool::new(false));
        let _watcher = start_auto_promote_watcher(
            store.db_path().to_path_buf(),
            sup_event_id,
            started_at,
            Duration::from_secs(cfg.stable_run_seconds),
            worker_exited.clone(),
        );

        let _ = store.log_event(
            Some(sup_event_id),
            EVENT_WORKER_SPAWNED,
            Some(&json!({"pid": child.id()})),
        );

        let wait_result = child.wait();
        worker_exited.store(true, Ordering::SeqCst);
        let uptime = started_at.elapsed();

        let exit_code = match &wait_result {
            Ok(status) => status.code().unwrap_or(-1),
            Err(_) => -1,
        };
        let _ = store.log_event(
            Some(sup_event_id),
            EVENT_WORKER_EXITED,
            Some(&json!({
                "exit_code": exit_code,
                "uptime_seconds": uptime.as_secs(),
            })),
        );

        match wait_result {
            Ok(status) if status.success() => log_line(&format!(
                "worker {instance_id} exited normally; restarting in {}s",
                cfg.restart_delay_seconds
            )),
            Ok(status) => log_line(&format!(
                "worker {instance_id} exited with status {status}; uptime={}s",
                uptime.as_secs()
            )),
            Err(err) => log_line(&format!(
                "worker {instance_id} wait failed: {err}; uptime={}s",
                uptime.as_secs()
            )),
        }

        let stable_threshold = Duration::from_secs(cfg.stable_run_seconds);
        if uptime >= stable_threshold {
            if let Err(err) = promote_latest_deployed(&store, sup_event_id) {
                log_line(&format!("promote artifact failed: {err}"));
            }
            let rev = git_head_rev(&cfg.workspace_dir);
            if !rev.is_empty() {
                let _ = store.log_event(
                    Some(sup_event_id),
                    EVENT_REVISION_PROMOTED,
                    Some(&json!({"revision": rev})),
                );
            }
            crash_times.clear();
        } else {
            let now = Instant::now();
            crash_times.push(now);
            prune_crash_window(
                &mut crash_times,
                now,
                Duration::from_secs(cfg.crash_window_seconds),
            );

            if crash_times.len() >= cfg.crash_threshold {
                let _ = store.log_event(
                    Some(sup_event_id),
                    EVENT_CRASH_LOOP_DETECTED,
                    Some(&json!({
                        "threshold": cfg.crash_threshold,
                        "window_seconds": cfg.crash_window_seconds,
                    })),
                );
                let rolled_back = match attempt_artifact_rollback(&cfg, &store, sup_event_id) {
                    Ok(rolled_back) => rolled_back,
                    Err(err) => {
                        log_line(&format!("artifact rollback failed: {err}"));
                        false
                    }
                };
                if !rolled_back {
                    attempt_source_rollback(&cfg, &store, sup_event_id);
                }
                crash_times.clear();
            }
        }

        std::thread::sleep(Duration::from_secs(cfg.restart_delay_seconds));
    }
}

/// Drop crash timestamps older than the window.
fn prune_crash_window(times: &mut Vec<Instant>, now: Instant, window: Duration) {
    times.retain(|t| now.saturating_duration_since(*t) <= window);
}

fn git_head_rev(workspace_dir: &str) -> String {
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

/// Fallback when no artifact rollback was possible: check the workspace
/// out at the last good revision and rebuild the worker. Only runs when
/// the operator explicitly enabled auto rollback.
fn attempt_source_rollback(cfg: &SupervisorConfig, store: &Store, sup_event_id: i64) {
    let rev = match store.current_good_rev() {
        Ok(Some(rev)) => rev,
        Ok(None) => {
            log_line("rollback skipped: no current_good_rev");
            return;
        }
        Err(err) => {
            log_line(&format!("rollback skipped: {err}"));
            return;
        }
    };

    if !cfg.auto_rollback {
        log_line(&format!(
            "crash threshold reached; auto rollback disabled. target_rev={rev}"
        ));
        let _ = store.log_event(
            Some(sup_event_id),
            EVENT_ROLLBACK_ATTEMPTED,
            Some(&json!({"target_revision": rev, "success": false})),
        );
        return;
    }

    log_line(&format!("crash threshold reached; rolling back workspace to {rev}"));

    let checkout = Command::new("git")
        .args(["-C", &cfg.workspace_dir, "checkout", &rev, "--", "."])
        .status();
    if !matches!(checkout, Ok(status) if status.success()) {
        log_line("rollback failed: git checkout returned error");
        let _ = store.log_event(
            Some(sup_event_id),
            EVENT_ROLLBACK_ATTEMPTED,
            Some(&json!({"target_revision": rev, "success": false})),
        );
        return;
    }

    let build = Command::new("bash")
        .args(["-lc", &cfg.rollback_build_cmd])
        .current_dir(&cfg.workspace_dir)
        .status();
    if !matches!(build, Ok(status) if status.success()) {
        log_line("rollback failed: worker build returned error");
        let _ = store.log_event(
            Some(sup_event_id),
            EVENT_ROLLBACK_ATTEMPTED,
            Some(&json!({"target_revision": rev, "success": false})),
        );
        return;
    }

    let _ = store.log_event(
        Some(sup_event_id),
        EVENT_ROLLBACK_ATTEMPTED,
        Some(&json!({"target_revision": rev, "success": true})),
    );
    log_line(&format!("rollback applied and worker rebuilt at rev={rev}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_crash_window_drops_stale_entries() {
        // Offset the reference point forward so the subtractions below can
        // never underflow the monotonic clock.
        let now = Instant::now() + Duration::from_secs(1000);
        let mut times = vec![
            now - Duration::from_secs(400),
            now - Duration::from_secs(100),
            now,
        ];
        prune_crash_window(&mut times, now, Duration::from_secs(300));
        assert_eq!(times.len(), 2);
    }

    #[test]
    fn prune_crash_window_keeps_boundary_entry() {
        let now = Instant::now() + Duration::from_secs(1000);
        let mut times = vec![now - Duration::from_secs(300)];
        prune_crash_window(&mut times, now, Duration::from_secs(300));
        assert_eq!(times.len(), 1);
    }

    #[test]
    fn worker_instance_ids_are_zero_padded() {
        assert_eq!(format!("W{:06}", 1), "W000001");
        assert_eq!(format!("W{:06}", 42), "W000042");
    }

    #[test]
    fn source_rollback_disabled_records_failed_attempt() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(dir.path().join("sup.db")).unwrap();
        let root = store
            .log_event(None, EVENT_PROCESS_STARTED, Some(&json!({"role": "supervisor"})))
            .unwrap();
        store
            .log_event(Some(root), EVENT_REVISION_PROMOTED, Some(&json!({"revision": "rev-good"})))
            .unwrap();
        let cfg = config::tests_support::test_cfg(dir.path(), &dir.path().join("worker"));

        attempt_source_rollback(&cfg, &store, root);

        let attempts: Vec<_> = store
            .subtree(root)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EVENT_ROLLBACK_ATTEMPTED)
            .filter_map(|e| e.payload_value())
            .collect();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0]["success"].as_bool(), Some(false));
        assert_eq!(attempts[0]["target_revision"].as_str(), Some("rev-good"));
    }
}
