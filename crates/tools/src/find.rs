#![forbid(unsafe_code)]

use super::exec::{finish_result, look_path, run_with_deadline};
use super::output::limit_lines;
use super::{Limits, Tool, ToolError, ToolPolicy, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct FindInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    name_pattern: String,
    #[serde(default)]
    max_depth: i64,
    #[serde(default)]
    limit: i64,
}

pub struct Find {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl Find {
    pub fn new(
        policy: Arc<ToolPolicy>,
        base_dir: impl Into<String>,
        timeout: Duration,
        limits: Limits,
    ) -> Self {
        Self {
            policy,
            base_dir: base_dir.into(),
            timeout: if timeout.is_zero() {
                Duration::from_secs(30)
            } else {
                timeout
            },
            limits: limits.or_defaults(),
        }
    }

    fn parse(args: &Value) -> Result<FindInput, ToolError> {
        let input: FindInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid find input: {err}")))?;
        if input.path.trim().is_empty() {
            return Err(ToolError::validation("find.path is required"));
        }
        if input.max_depth < 0 {
            return Err(ToolError::validation("find.max_depth must be >= 0"));
        }
        if input.limit < 0 {
            return Err(ToolError::validation("find.limit must be >= 0"));
        }
        Ok(input)
    }
}

impl Tool for Find {
    fn name(&self) -> &'static str {
        "find"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let resolved = self.policy.resolve_allowed_path(&input.path, &self.base_dir)?;
        let pattern = if input.name_pattern.trim().is_empty() {
            "*"
        } else {
            input.name_pattern.trim()
        };

        let cmd = build_find_command(&resolved, pattern, input.max_depth, input.limit);
        let out = run_with_deadline(cmd, None, self.timeout)?;
        let mut result = finish_result(self.name(), out, self.limits, self.timeout)?;
        if input.limit > 0 {
            result.stdout = limit_lines(&result.stdout, input.limit as usize);
        }
        Ok(result)
    }
}

/// Prefer `fd`/`fdfind` globbing; fall back to POSIX `find`.
fn build_find_command(path: &Path, pattern: &str, max_depth: i64, limit: i64) -> Command {
    for fd_name in ["fd", "fdfind"] {
        if look_path(fd_name) {
            let mut cmd = Command::new(fd_name);
            cmd.args(["--color", "never", "--glob"]);
            if max_depth > 0 {
                cmd.args(["-d", &max_depth.to_string()]);
            }
            if limit > 0 {
                cmd.args(["--max-results", &limit.to_string()]);
            }
            cmd.arg(pattern).arg(path);
            return cmd;
        }
    }

    let mut cmd = Command::new("find");
    cmd.arg(path);
    if max_depth > 0 {
        cmd.args(["-maxdepth", &max_depth.to_string()]);
    }
    if pattern != "*" {
        cmd.args(["-name", pattern]);
    }
    cmd
}
