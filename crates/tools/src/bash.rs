#![forbid(unsafe_code)]

use super::exec::{finish_result, run_with_deadline};
use super::{Limits, Tool, ToolError, ToolPolicy, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct BashInput {
    #[serde(default)]
    command: String,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    workdir: String,
}

impl BashInput {
    fn resolve_command(&self) -> &str {
        let command = self.command.trim();
        if !command.is_empty() {
            return command;
        }
        self.cmd.trim()
    }

    fn resolve_workdir(&self) -> &str {
        let cwd = self.cwd.trim();
        if !cwd.is_empty() {
            return cwd;
        }
        self.workdir.trim()
    }
}

/// `bash -lc <command>` in a policy-resolved working directory, gated by
/// the denylist.
pub struct Bash {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl Bash {
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

    fn parse(args: &Value) -> Result<BashInput, ToolError> {
        let input: BashInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid bash input: {err}")))?;
        if input.resolve_command().is_empty() {
            return Err(ToolError::validation("bash.command is required"));
        }
        Ok(input)
    }
}

impl Tool for Bash {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let command = input.resolve_command();
        if self.policy.is_bash_denied(command) {
            return Err(ToolError::Policy("bash command denied by policy".to_string()));
        }

        let cwd = match input.resolve_workdir() {
            "" => ".",
            other => other,
        };
        let resolved_cwd = self.policy.resolve_allowed_path(cwd, &self.base_dir)?;

        let mut cmd = Command::new("bash");
        cmd.args(["-lc", command]).current_dir(&resolved_cwd);

        let out = run_with_deadline(cmd, None, self.timeout)?;
        finish_result(self.name(), out, self.limits, self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bash_for(dir: &std::path::Path, denylist: &str) -> Bash {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), denylist).unwrap());
        Bash::new(
            policy,
            dir.to_str().unwrap(),
            Duration::from_secs(5),
            Limits::default(),
        )
    }

    #[test]
    fn validate_accepts_command_or_cmd_alias() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = bash_for(dir.path(), "");
        assert!(tool.validate(&json!({})).is_err());
        assert!(tool.validate(&json!({"command": "echo hi"})).is_ok());
        assert!(tool.validate(&json!({"cmd": "echo hi"})).is_ok());
    }

    #[test]
    fn runs_in_resolved_cwd() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let tool = bash_for(dir.path(), "");
        let result = tool.execute(&json!({"command": "ls"})).unwrap();
        assert!(result.ok);
        assert!(result.stdout.contains("marker.txt"));
    }

    #[test]
    fn denied_command_is_policy_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = bash_for(dir.path(), "rm -rf");
        let err = tool.execute(&json!({"command": "rm -rf /"})).unwrap_err();
        assert!(matches!(err, ToolError::Policy(_)));
        assert!(err.to_string().contains("denied by policy"));
    }

    #[test]
    fn timeout_kills_long_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let policy = Arc::new(ToolPolicy::new(dir.path().to_str().unwrap(), "").unwrap());
        let tool = Bash::new(
            policy,
            dir.path().to_str().unwrap(),
            Duration::from_millis(200),
            Limits::default(),
        );
        let err = tool.execute(&json!({"command": "sleep 30"})).unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn nonzero_exit_surfaces_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = bash_for(dir.path(), "");
        let err = tool
            .execute(&json!({"command": "echo oops 1>&2; exit 4"}))
            .unwrap_err();
        let ToolError::Exec { message, result } = err else {
            panic!("expected exec error");
        };
        assert!(message.contains("exit status 4"));
        assert_eq!(result.stderr, "oops\n");
    }
}
