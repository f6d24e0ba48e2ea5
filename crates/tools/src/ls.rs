#![forbid(unsafe_code)]

use super::exec::{finish_result, run_with_deadline};
use super::output::limit_lines;
use super::{Limits, Tool, ToolError, ToolPolicy, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct LsInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    limit: i64,
}

pub struct Ls {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl Ls {
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

    fn parse(args: &Value) -> Result<LsInput, ToolError> {
        let input: LsInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid ls input: {err}")))?;
        if input.path.trim().is_empty() {
            return Err(ToolError::validation("ls.path is required"));
        }
        if input.limit < 0 {
            return Err(ToolError::validation("ls.limit must be >= 0"));
        }
        Ok(input)
    }
}

impl Tool for Ls {
    fn name(&self) -> &'static str {
        "ls"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let resolved = self.policy.resolve_allowed_path(&input.path, &self.base_dir)?;

        let mut cmd = Command::new("ls");
        cmd.arg("-1");
        if input.recursive {
            cmd.arg("-R");
        }
        cmd.arg(&resolved);

        let out = run_with_deadline(cmd, None, self.timeout)?;
        let mut result = finish_result(self.name(), out, self.limits, self.timeout)?;
        if input.limit > 0 {
            result.stdout = limit_lines(&result.stdout, input.limit as usize);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ls_for(dir: &std::path::Path) -> Ls {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), "").unwrap());
        Ls::new(
            policy,
            dir.to_str().unwrap(),
            Duration::from_secs(2),
            Limits {
                max_lines: 100,
                max_bytes: 4096,
            },
        )
    }

    #[test]
    fn validate_requires_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = ls_for(dir.path());
        assert!(tool.validate(&json!({})).is_err());
        assert!(tool.validate(&json!({"path": ".", "limit": -1})).is_err());
        assert!(tool.validate(&json!({"path": "."})).is_ok());
    }

    #[test]
    fn lists_directory_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let tool = ls_for(dir.path());
        let result = tool.execute(&json!({"path": "."})).unwrap();
        assert!(result.ok);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("a.txt"));
        assert!(result.stdout.contains("b.txt"));
    }

    #[test]
    fn missing_path_is_exec_error_with_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = ls_for(dir.path());
        let err = tool.execute(&json!({"path": "missing.txt"})).unwrap_err();
        let ToolError::Exec { message, result } = err else {
            panic!("expected exec error");
        };
        assert!(message.contains("ls execution failed"));
        assert!(!result.ok);
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn limit_caps_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let tool = ls_for(dir.path());
        let result = tool.execute(&json!({"path": ".", "limit": 2})).unwrap();
        assert_eq!(result.stdout.lines().filter(|l| !l.is_empty()).count(), 2);
    }
}
