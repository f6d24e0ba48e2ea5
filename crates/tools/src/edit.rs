#![forbid(unsafe_code)]

use super::exec::{finish_result, run_with_deadline};
use super::{Limits, Tool, ToolError, ToolPolicy, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct EditInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    old_text: String,
    #[serde(default)]
    new_text: String,
    #[serde(default)]
    all: bool,
}

/// In-place substitution via `sed -i.bak`; the backup file is removed on
/// success.
pub struct Edit {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl Edit {
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

    fn parse(args: &Value) -> Result<EditInput, ToolError> {
        let input: EditInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid edit input: {err}")))?;
        if input.path.trim().is_empty() {
            return Err(ToolError::validation("edit.path is required"));
        }
        if input.old_text.is_empty() {
            return Err(ToolError::validation("edit.old_text is required"));
        }
        Ok(input)
    }
}

impl Tool for Edit {
    fn name(&self) -> &'static str {
        "edit"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let resolved = self.policy.resolve_allowed_path(&input.path, &self.base_dir)?;

        let mut script = format!(
            "s|{}|{}|",
            escape_sed(&input.old_text),
            escape_sed(&input.new_text)
        );
        if input.all {
            script.push('g');
        }

        let mut cmd = Command::new("sed");
        cmd.arg("-i.bak").arg("-e").arg(&script).arg(&resolved);

        let out = run_with_deadline(cmd, None, self.timeout)?;
        let mut backup = resolved.into_os_string();
        backup.push(".bak");
        let _ = std::fs::remove_file(&backup);
        finish_result(self.name(), out, self.limits, self.timeout)
    }
}

fn escape_sed(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('&', "\\&")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edit_for(dir: &std::path::Path) -> Edit {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), "").unwrap());
        Edit::new(
            policy,
            dir.to_str().unwrap(),
            Duration::from_secs(2),
            Limits::default(),
        )
    }

    #[test]
    fn validate_requires_path_and_old_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let tool = edit_for(dir.path());
        assert!(tool.validate(&json!({"old_text": "x"})).is_err());
        assert!(tool.validate(&json!({"path": "f"})).is_err());
        assert!(tool.validate(&json!({"path": "f", "old_text": "x"})).is_ok());
    }

    #[test]
    fn replaces_first_occurrence_and_removes_backup() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("code.txt");
        std::fs::write(&file, "foo bar foo\n").unwrap();
        let tool = edit_for(dir.path());
        let result = tool
            .execute(&json!({"path": "code.txt", "old_text": "foo", "new_text": "baz"}))
            .unwrap();
        assert!(result.ok);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "baz bar foo\n");
        assert!(!dir.path().join("code.txt.bak").exists());
    }

    #[test]
    fn all_flag_replaces_every_occurrence() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("code.txt");
        std::fs::write(&file, "foo bar foo\n").unwrap();
        let tool = edit_for(dir.path());
        tool.execute(&json!({"path": "code.txt", "old_text": "foo", "new_text": "baz", "all": true}))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "baz bar baz\n");
    }

    #[test]
    fn pipe_characters_are_escaped() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("code.txt");
        std::fs::write(&file, "a|b\n").unwrap();
        let tool = edit_for(dir.path());
        tool.execute(&json!({"path": "code.txt", "old_text": "a|b", "new_text": "c|d"}))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "c|d\n");
    }
}
