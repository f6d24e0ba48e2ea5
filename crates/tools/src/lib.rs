#![forbid(unsafe_code)]
//! Filesystem-sandboxed tool execution.
//!
//! Every tool follows the same two-phase contract: `validate` rejects
//! malformed arguments without spawning anything, `execute` resolves paths
//! through the policy, runs one subprocess under a deadline and returns the
//! uniform result envelope with truncation flags.

mod bash;
mod edit;
mod exec;
mod find;
mod grep;
mod ls;
mod output;
mod policy;
mod read;
mod registry;
mod runner;
mod write;

use serde_json::Value;

pub use bash::Bash;
pub use edit::Edit;
pub use find::Find;
pub use grep::Grep;
pub use ls::Ls;
pub use output::{apply_output_limits, build_cursor, Limits};
pub use policy::ToolPolicy;
pub use read::ReadTool;
pub use registry::Registry;
pub use runner::{Runner, ToolCall};
pub use write::WriteTool;

/// Strict output envelope for tool execution.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ToolResult {
    pub ok: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated_lines: bool,
    pub truncated_bytes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Tool failures, separated so the caller can classify without string
/// matching on variants it constructed itself. `Exec` still carries the
/// truncated output envelope: a failing subprocess usually said something
/// useful on stderr.
#[derive(Debug)]
pub enum ToolError {
    /// Malformed or missing arguments; maps to exit code 2 without spawning.
    Validation(String),
    /// Path or command refused by the sandbox policy.
    Policy(String),
    /// The subprocess ran and failed (non-zero exit, kill, or deadline).
    Exec {
        message: String,
        result: Box<ToolResult>,
    },
    /// The subprocess could not be started or its pipes broke.
    Io(std::io::Error),
}

impl ToolError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// The partial result envelope, when the failure produced one.
    pub fn result(&self) -> Option<&ToolResult> {
        match self {
            Self::Exec { result, .. } => Some(result),
            _ => None,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => f.write_str(message),
            Self::Policy(message) => f.write_str(message),
            Self::Exec { message, .. } => f.write_str(message),
            Self::Io(err) => write!(f, "tool io: {err}"),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<std::io::Error> for ToolError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Common abstraction for all atomic tools.
pub trait Tool {
    fn name(&self) -> &'static str;
    fn validate(&self, args: &Value) -> Result<(), ToolError>;
    fn execute(&self, args: &Value) -> Result<ToolResult, ToolError>;
}
