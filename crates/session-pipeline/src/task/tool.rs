//! Tool collaborators available to a task's backend.

use super::ToolError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A pure request/response collaborator (data retrieval, chart rendering, ...).
///
/// Tools share no state with the orchestrator.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name within a task's tool set.
    fn name(&self) -> &str;

    /// Description offered to reasoning backends.
    fn description(&self) -> &str {
        ""
    }

    /// Performs the call.
    async fn call(&self, args: JsonValue) -> Result<JsonValue, ToolError>;
}

/// The tools a task may invoke.
#[derive(Clone, Default)]
pub struct Toolset {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Toolset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Builder form of [`Toolset::register`].
    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Calls a tool by name.
    pub async fn call(&self, name: &str, args: JsonValue) -> Result<JsonValue, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        debug!(tool = %name, "Calling tool");
        tool.call(args).await
    }
}

impl fmt::Debug for Toolset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolset")
            .field("tools", &self.names())
            .finish()
    }
}
