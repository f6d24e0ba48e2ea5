#![forbid(unsafe_code)]

use super::{Registry, ToolError, ToolResult};
use serde_json::Value;

/// One tool invocation request, as parsed from the model's protocol
/// envelope.
#[derive(Clone, Debug)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Dispatches one call: name lookup, validation, then execution. Unknown
/// tools and argument problems surface as validation errors so the caller
/// can classify them apart from execution failures.
pub struct Runner<'a> {
    registry: &'a Registry,
}

impl<'a> Runner<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    pub fn run_one(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let name = call.name.trim();
        if name.is_empty() {
            return Err(ToolError::validation("validation: empty tool name"));
        }
        let Some(tool) = self.registry.get(name) else {
            return Err(ToolError::validation(format!(
                "validation: unknown tool: {name}"
            )));
        };
        tool.validate(&call.arguments)?;
        tool.execute(&call.arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Limits, Ls, ToolPolicy};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry_with_ls(dir: &std::path::Path) -> Registry {
        let policy = Arc::new(ToolPolicy::new(dir.to_str().unwrap(), "").unwrap());
        let mut registry = Registry::new();
        registry
            .register(Box::new(Ls::new(
                policy,
                dir.to_str().unwrap(),
                Duration::from_secs(2),
                Limits {
                    max_lines: 100,
                    max_bytes: 4096,
                },
            )))
            .unwrap();
        registry
    }

    #[test]
    fn empty_name_is_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with_ls(dir.path());
        let runner = Runner::new(&registry);
        let err = runner
            .run_one(&ToolCall {
                name: "  ".into(),
                arguments: json!({}),
            })
            .unwrap_err();
        assert!(err.to_string().contains("empty tool name"));
    }

    #[test]
    fn unknown_tool_is_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with_ls(dir.path());
        let runner = Runner::new(&registry);
        let err = runner
            .run_one(&ToolCall {
                name: "nope".into(),
                arguments: json!({}),
            })
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool: nope"));
    }

    #[test]
    fn invalid_arguments_short_circuit() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with_ls(dir.path());
        let runner = Runner::new(&registry);
        let err = runner
            .run_one(&ToolCall {
                name: "ls".into(),
                arguments: json!({}),
            })
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[test]
    fn valid_call_executes() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();
        let registry = registry_with_ls(dir.path());
        let runner = Runner::new(&registry);
        let result = runner
            .run_one(&ToolCall {
                name: "ls".into(),
                arguments: json!({"path": "."}),
            })
            .unwrap();
        assert!(result.ok);
        assert!(result.stdout.contains("hello.txt"));
    }
}
