#![forbid(unsafe_code)]

use super::exec::{finish_result, run_with_deadline};
use super::{Limits, Tool, ToolError, ToolPolicy, ToolResult};
use serde::Deserialize;
use serde_json::Value;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
struct WriteInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    append: bool,
}

/// File write via `tee [-a]` with the content on stdin. The echoed stdout
/// is discarded.
pub struct WriteTool {
    policy: Arc<ToolPolicy>,
    base_dir: String,
    timeout: Duration,
    limits: Limits,
}

impl WriteTool {
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

    fn parse(args: &Value) -> Result<WriteInput, ToolError> {
        let input: WriteInput = serde_json::from_value(args.clone())
            .map_err(|err| ToolError::validation(format!("invalid write input: {err}")))?;
        if input.path.trim().is_empty() {
            return Err(ToolError::validation("write.path is required"));
        }
        Ok(input)
    }
}

impl Tool for WriteTool {
    fn name(&self) -> &'static str {
        "write"
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError> {
        let input = Self::parse(args)?;
        let resolved = self.policy.resolve_allowed_path(&input.path, &self.base_dir)?;

        let mut cmd = Command::new("tee");
        if input.append {
            cmd.arg("-a");
        }
        cmd.arg(&resolved);

        let out = run_with_deadline(cmd, Some(input.content.as_bytes()), self.timeout)?;
        let mut result = finish_result(self.name(), out, self.limits, self.timeout)?;
        result.stdout = String::new();
        Ok(result)
    }
}
