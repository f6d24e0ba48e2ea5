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
struct GrepInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    pattern: String,
    #[serde(default)]
    glob: String,
    #[serde(default)]
    limit: i64,
}

pub struct Grep {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl Grep {
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

    fn parse(args: &Value) -> Result<GrepInput, ToolError> {
        let input: GrepInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid grep input: {err}")))?;
        if input.path.trim().is_empty() {
            return Err(ToolError::validation("grep.path is required"));
        }
        if input.pattern.trim().is_empty() {
            return Err(ToolError::validation("grep.pattern is required"));
        }
        if input.limit < 0 {
            return Err(ToolError::validation("grep.limit must be >= 0"));
        }
        Ok(input)
    }
}

impl Tool for Grep {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let resolved = self.policy.resolve_allowed_path(&input.path, &self.base_dir)?;

        let cmd = build_grep_command(&resolved, &input.pattern, &input.glob, input.limit);
        let out = run_with_deadline(cmd, None, self.timeout)?;
        let mut result = finish_result(self.name(), out, self.limits, self.timeout)?;
        if input.limit > 0 {
            result.stdout = limit_lines(&result.stdout, input.limit as usize);
        }
        Ok(result)
    }
}

/// Prefer ripgrep; fall back to recursive `grep`.
fn build_grep_command(path: &Path, pattern: &str, glob: &str, limit: i64) -> Command {
    if look_path("rg") {
        let mut cmd = Command::new("rg");
        cmd.args(["--line-number", "--no-heading", "--color", "never"]);
        if !glob.trim().is_empty() {
            cmd.args(["-g", glob]);
        }
        if limit > 0 {
            cmd.args(["--max-count", &limit.to_string()]);
        }
        cmd.arg(pattern).arg(path);
        return cmd;
    }

    let mut cmd = Command::new("grep");
    cmd.args(["-R", "-n", "-H"]);
    if limit > 0 {
        cmd.args(["-m", &limit.to_string()]);
    }
    if !glob.trim().is_empty() {
        cmd.arg(format!("--include={glob}"));
    }
    cmd.arg(pattern).arg(path);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grep_for(dir: &std::path::Path) -> Grep {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), "").unwrap());
        Grep::new(
            policy,
            dir.to_str().unwrap(),
            Duration::from_secs(5),
            Limits {
                max_lines: 200,
                max_bytes: 8192,
            },
        )
    }

    #[test]
    fn validate_requires_path_and_pattern() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = grep_for(dir.path());
        assert!(tool.validate(&json!({"pattern": "x"})).is_err());
        assert!(tool.validate(&json!({"path": "."})).is_err());
        assert!(tool.validate(&json!({"path": ".", "pattern": "x"})).is_ok());
    }

    #[test]
    fn matches_lines_with_numbers() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("src.txt"), "alpha\nneedle here\nomega\n").unwrap();
        let tool = grep_for(dir.path());
        let result = tool.execute(&json!({"path": ".", "pattern": "needle"})).unwrap();
        assert!(result.ok);
        assert!(result.stdout.contains("needle here"));
        assert!(result.stdout.contains(':'), "expected file:line prefix: {}", result.stdout);
    }

    #[test]
    fn no_match_is_exec_error() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("src.txt"), "nothing\n").unwrap();
        let tool = grep_for(dir.path());
        // Both rg and grep exit 1 on no matches.
        let err = tool
            .execute(&json!({"path": ".", "pattern": "absent-token"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Exec { .. }));
    }
}
