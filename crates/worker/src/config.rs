#![forbid(unsafe_code)]

use std::path::Path;

/// Worker configuration, loaded from the environment.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub timeout: i64,
    pub sleep_seconds: u64,
    pub drop_pending: bool,
    pub pending_window_seconds: i64,
    pub pending_max_messages: usize,
    pub history_window: i64,
    pub worker_instance_id: String,
    pub parent_process_id: i64,
    pub suicide_every: u64,
    pub model_name: String,
    pub model_provider: String,
    pub commander: String,
    pub provider_script: String,
    pub commander_script: String,
    pub commander_send_script: String,
    pub system_prompt_env: String,
    pub system_prompt_file: String,
    pub config_dir: String,
    pub db_path: String,
    pub workspace_dir: String,
    pub control_max_turns: i64,
    pub control_max_wall_time_seconds: i64,
    pub control_max_tokens: i64,
    pub control_max_retries: i64,
    pub tool_timeout_seconds: u64,
    pub tool_max_output_lines: usize,
    pub tool_max_output_bytes: usize,
    pub tool_bash_denylist: String,
    pub tool_allowed_roots: String,
    pub update_artifact_root: String,
    pub update_build_cmd: String,
    pub update_build_artifact: String,
    pub update_test_cmd: String,
    pub update_self_check_cmd: String,
    pub update_pipeline_timeout_seconds: u64,
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_dir = env_or_default("WORKSPACE_DIR", "/workspace");
        let config_dir = env_or_default("AUTONOUS_CONFIG_DIR", &workspace_dir);
        let default_prompt_file = format!("{config_dir}/AUTONOUS.md");
        let cfg = Self {
            timeout: env_int_or_default("TG_TIMEOUT", 30),
            sleep_seconds: env_int_or_default("TG_SLEEP_SECONDS", 1) as u64,
            drop_pending: env_bool_or_default("TG_DROP_PENDING", true),
            pending_window_seconds: env_int_or_default("TG_PENDING_WINDOW_SECONDS", 600),
            pending_max_messages: env_int_or_default("TG_PENDING_MAX_MESSAGES", 50) as usize,
            history_window: env_int_or_default("TG_HISTORY_WINDOW", 12),
            worker_instance_id: env_or_default("WORKER_INSTANCE_ID", "W000000"),
            parent_process_id: env_int_or_default("PARENT_PROCESS_ID", 0),
            suicide_every: env_int_or_default("WORKER_SUICIDE_EVERY", 0) as u64,
            model_name: env_or_default("AUTONOUS_MODEL_NAME", "scripted-default"),
            model_provider: env_or_default("AUTONOUS_MODEL_PROVIDER", "scripted"),
            commander: env_or_default("AUTONOUS_COMMANDER", "scripted"),
            provider_script: env_or_default("AUTONOUS_SCRIPTED_PROVIDER_SCRIPT", "ok"),
            commander_script: env_or_default("AUTONOUS_SCRIPTED_COMMANDER_SCRIPT", "ok"),
            commander_send_script: env_or_default("AUTONOUS_SCRIPTED_COMMANDER_SEND_SCRIPT", "ok"),
            system_prompt_env: std::env::var("WORKER_SYSTEM_PROMPT").unwrap_or_default(),
            system_prompt_file: env_or_default("AUTONOUS_SYSTEM_PROMPT_FILE", &default_prompt_file),
            config_dir,
            db_path: env_or_default("AUTONOUS_DB_PATH", "/state/agent.db"),
            workspace_dir,
            control_max_turns: env_int_or_default("AUTONOUS_CONTROL_MAX_TURNS", 1),
            control_max_wall_time_seconds: env_int_or_default(
                "AUTONOUS_CONTROL_MAX_WALL_TIME_SECONDS",
                120,
            ),
            control_max_tokens: env_int_or_default("AUTONOUS_CONTROL_MAX_TOKENS", 100_000),
            control_max_retries: env_int_or_default("AUTONOUS_CONTROL_MAX_RETRIES", 3),
            tool_timeout_seconds: env_int_or_default("AUTONOUS_TOOL_TIMEOUT_SECONDS", 30) as u64,
            tool_max_output_lines: env_int_or_default("AUTONOUS_TOOL_MAX_OUTPUT_LINES", 2000)
                as usize,
            tool_max_output_bytes: env_int_or_default("AUTONOUS_TOOL_MAX_OUTPUT_BYTES", 51200)
                as usize,
            tool_bash_denylist: env_or_default("AUTONOUS_TOOL_BASH_DENYLIST", ""),
            tool_allowed_roots: env_or_default("AUTONOUS_TOOL_ALLOWED_ROOTS", "/workspace,/state"),
            update_artifact_root: env_or_default("AUTONOUS_UPDATE_ARTIFACT_ROOT", "/state/artifacts"),
            update_build_cmd: env_or_default(
                "AUTONOUS_UPDATE_BUILD_CMD",
                "cargo build --release --bin autonous-worker",
            ),
            update_build_artifact: env_or_default(
                "AUTONOUS_UPDATE_BUILD_ARTIFACT",
                "target/release/autonous-worker",
            ),
            update_test_cmd: env_or_default("AUTONOUS_UPDATE_TEST_CMD", "cargo test --workspace"),
            update_self_check_cmd: env_or_default("AUTONOUS_UPDATE_SELF_CHECK_CMD", ""),
            update_pipeline_timeout_seconds: env_int_or_default(
                "AUTONOUS_UPDATE_PIPELINE_TIMEOUT_SECONDS",
                1800,
            ) as u64,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.control_max_turns <= 0 {
            return Err(ConfigError("AUTONOUS_CONTROL_MAX_TURNS must be > 0".into()));
        }
        if self.control_max_wall_time_seconds <= 0 {
            return Err(ConfigError(
                "AUTONOUS_CONTROL_MAX_WALL_TIME_SECONDS must be > 0".into(),
            ));
        }
        if self.control_max_retries < 0 {
            return Err(ConfigError("AUTONOUS_CONTROL_MAX_RETRIES must be >= 0".into()));
        }
        if self.tool_timeout_seconds == 0 {
            return Err(ConfigError("AUTONOUS_TOOL_TIMEOUT_SECONDS must be > 0".into()));
        }
        if self.tool_max_output_lines == 0 {
            return Err(ConfigError("AUTONOUS_TOOL_MAX_OUTPUT_LINES must be > 0".into()));
        }
        if self.tool_max_output_bytes == 0 {
            return Err(ConfigError("AUTONOUS_TOOL_MAX_OUTPUT_BYTES must be > 0".into()));
        }
        if self.update_pipeline_timeout_seconds == 0 {
            return Err(ConfigError(
                "AUTONOUS_UPDATE_PIPELINE_TIMEOUT_SECONDS must be > 0".into(),
            ));
        }
        if self.update_artifact_root.trim().is_empty() {
            return Err(ConfigError("AUTONOUS_UPDATE_ARTIFACT_ROOT cannot be empty".into()));
        }
        if !Path::new(&self.update_artifact_root).is_absolute() {
            return Err(ConfigError("AUTONOUS_UPDATE_ARTIFACT_ROOT must be absolute".into()));
        }
        validate_allowed_roots(&self.tool_allowed_roots)?;
        Ok(())
    }
}

fn validate_allowed_roots(raw: &str) -> Result<(), ConfigError> {
    let mut any = false;
    for part in raw.split(',') {
        let root = part.trim();
        if root.is_empty() {
            continue;
        }
        if !Path::new(root).is_absolute() {
            return Err(ConfigError(format!(
                "AUTONOUS_TOOL_ALLOWED_ROOTS requires absolute paths: {root}"
            )));
        }
        any = true;
    }
    if !any {
        return Err(ConfigError("AUTONOUS_TOOL_ALLOWED_ROOTS cannot be empty".into()));
    }
    Ok(())
}

pub fn env_or_default(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

pub fn env_int_or_default(key: &str, fallback: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(fallback)
}

pub fn env_bool_or_default(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v == "1" || v.eq_ignore_ascii_case("true"),
        _ => fallback,
    }
}

/// Resolved system prompt plus where it came from.
#[derive(Debug)]
pub struct SystemPrompt {
    pub text: String,
    pub source: &'static str,
    pub size: usize,
}

pub fn builtin_system_prompt() -> &'static str {
    "You are the autonous execution worker. Reply concisely and accurately; \
     include runnable steps when the task calls for them."
}

/// Resolve the system prompt: prompt file, then environment, then the
/// built-in default. A real read error (anything but not-found) is
/// returned alongside the fallback so the caller can log it.
pub fn load_system_prompt(cfg: &WorkerConfig) -> (SystemPrompt, Option<std::io::Error>) {
    match std::fs::read_to_string(&cfg.system_prompt_file) {
        Ok(content) => {
            let size = content.len();
            let text = content.replace("{AUTONOUS_CONFIG_DIR}", &cfg.config_dir);
            (
                SystemPrompt {
                    text,
                    source: "file",
                    size,
                },
                None,
            )
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (fallback_prompt(cfg), None),
        Err(err) => (fallback_prompt(cfg), Some(err)),
    }
}

fn fallback_prompt(cfg: &WorkerConfig) -> SystemPrompt {
    let metadata = format!(
        "\n\nconfig dir: {}\nsystem prompt file: {}",
        cfg.config_dir, cfg.system_prompt_file
    );
    if !cfg.system_prompt_env.trim().is_empty() {
        let text = format!("{}{}", cfg.system_prompt_env, metadata);
        let size = text.len();
        return SystemPrompt {
            text,
            source: "env",
            size,
        };
    }
    let text = format!("{}{}", builtin_system_prompt(), metadata);
    let size = text.len();
    SystemPrompt {
        text,
        source: "builtin",
        size,
    }
}
