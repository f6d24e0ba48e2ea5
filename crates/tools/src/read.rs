#![forbid(unsafe_code)]

use super::exec::{finish_result, run_with_deadline};
use super::output::build_cursor;
use super::{Limits, Tool, ToolError, ToolPolicy, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct ReadInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    limit: i64,
}

/// Windowed file read via `sed -n '<start>,<end>p'`.
pub struct ReadTool {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl ReadTool {
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

    fn parse(args: &Value) -> Result<ReadInput, ToolError> {
        let input: ReadInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid read input: {err}")))?;
        if input.path.trim().is_empty() {
            return Err(ToolError::validation("read.path is required"));
        }
        if input.offset < 0 {
            return Err(ToolError::validation("read.offset must be >= 0"));
        }
        if input.limit <= 0 {
            return Err(ToolError::validation("read.limit must be > 0"));
        }
        Ok(input)
    }
}

impl Tool for ReadTool {
    fn name(&self) -> &'static str {
        "read"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let resolved = self.policy.resolve_allowed_path(&input.path, &self.base_dir)?;

        let start_line = input.offset + 1;
        let end_line = input.offset + input.limit;
        let range = format!("{start_line},{end_line}p");

        let mut cmd = Command::new("sed");
        cmd.arg("-n").arg(&range).arg(&resolved);

        let out = run_with_deadline(cmd, None, self.timeout)?;
        let mut result = finish_result(self.name(), out, self.limits, self.timeout)?;
        // A full window suggests more content; hand back a cursor for the
        // follow-up read.
        let line_count = result.stdout.lines().count() as i64;
        if line_count >= input.limit {
            result.next_page_cursor = Some(build_cursor(&input.path, end_line));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_for(dir: &std::path::Path) -> ReadTool {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), "").unwrap());
        ReadTool::new(
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
    fn validate_requires_positive_limit() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = read_for(dir.path());
        assert!(tool.validate(&json!({"path": "f"})).is_err());
        assert!(tool.validate(&json!({"path": "f", "limit": 0})).is_err());
        assert!(tool.validate(&json!({"path": "f", "limit": 5, "offset": -1})).is_err());
        assert!(tool.validate(&json!({"path": "f", "limit": 5})).is_ok());
    }

    #[test]
    fn reads_window_with_offset() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("lines.txt"), "l1\nl2\nl3\nl4\nl5\n").unwrap();
        let tool = read_for(dir.path());
        let result = tool
            .execute(&json!({"path": "lines.txt", "offset": 1, "limit": 2}))
            .unwrap();
        assert_eq!(result.stdout, "l2\nl3\n");
        // Window was full, so a continuation cursor is offered.
        assert!(result.next_page_cursor.is_some());
    }

    #[test]
    fn short_tail_has_no_cursor() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("lines.txt"), "l1\nl2\n").unwrap();
        let tool = read_for(dir.path());
        let result = tool
            .execute(&json!({"path": "lines.txt", "offset": 1, "limit": 10}))
            .unwrap();
        assert_eq!(result.stdout, "l2\n");
        assert!(result.next_page_cursor.is_none());
    }
}
