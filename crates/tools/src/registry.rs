#![forbid(unsafe_code)]

use super::{Tool, ToolError};
use std::collections::BTreeMap;

/// Tools keyed by unique name. Iteration order is alphabetical so the
/// protocol instruction lists tools deterministically.
#[derive(Default)]
pub struct Registry {
    tools: BTreeMap<&'static str, Box<dyn Tool>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().trim();
        if name.is_empty() {
            return Err(ToolError::validation("tool name is empty"));
        }
        if self.tools.contains_key(name) {
            return Err(ToolError::validation(format!(
                "tool already registered: {name}"
            )));
        }
        self.tools.insert(tool.name(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(Box::as_ref)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
