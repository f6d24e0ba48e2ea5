#![forbid(unsafe_code)]

/// Supervisor configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Active worker binary path (usually a symlink the deploys swap).
    pub worker_bin: String,
    pub workspace_dir: String,
    pub state_db_path: String,
    pub restart_delay_seconds: u64,
    pub crash_window_seconds: u64,
    pub crash_threshold: usize,
    pub stable_run_seconds: u64,
    pub auto_rollback: bool,
    pub update_artifact_root: String,
    /// Build command used only by the source-rollback fallback.
    pub rollback_build_cmd: String,
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let default_worker_bin = env_or_default("WORKER_BIN", "/workspace/bin/worker");
        let active_bin = env_or_default("AUTONOUS_UPDATE_ACTIVE_BIN", &default_worker_bin);
        Self {
            worker_bin: active_bin,
            workspace_dir: env_or_default("WORKSPACE_DIR", "/workspace"),
            state_db_path: env_or_default("AUTONOUS_DB_PATH", "/state/agent.db"),
            restart_delay_seconds: env_int_or_default("SUPERVISOR_RESTART_DELAY_SECONDS", 1) as u64,
            crash_window_seconds: env_int_or_default("SUPERVISOR_CRASH_WINDOW_SECONDS", 300) as u64,
            crash_threshold: env_int_or_default("SUPERVISOR_CRASH_THRESHOLD", 3) as usize,
            stable_run_seconds: env_int_or_default("SUPERVISOR_STABLE_RUN_SECONDS", 30) as u64,
            auto_rollback: env_bool_or_default("SUPERVISOR_AUTO_ROLLBACK", false),
            update_artifact_root: env_or_default("AUTONOUS_UPDATE_ARTIFACT_ROOT", "/state/artifacts"),
            rollback_build_cmd: env_or_default(
                "AUTONOUS_ROLLBACK_BUILD_CMD",
                "cargo build --release --bin autonous-worker",
            ),
        }
    }
}

fn env_or_default(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn env_int_or_default(key: &str, fallback: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(fallback)
}

fn env_bool_or_default(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v == "1" || v.eq_ignore_ascii_case("true"),
        _ => fallback,
    }
}
