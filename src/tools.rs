//! Tool adapter and registry.
//!
//! Each remote tool is wrapped as an object satisfying the local tool
//! contract, so the agent loop cannot distinguish a remote tool from a
//! native one. Remote failures (including `isError` results) become failed
//! [`ToolResult`]s carrying the remote text, never a panic or a propagated
//! error, preserving the at-most-one-result contract the tool executor
//! expects.

use crate::manager::{McpClientManager, NamespacedTool};
use crate::protocol::{CallToolResult, ContentBlock};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Uniform success/failure shape shared with natively-implemented tools.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Local tool contract consumed by the agent's tool executor.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema shape of the accepted arguments.
    fn parameters(&self) -> &Value;
    async fn execute(&self, arguments: Map<String, Value>) -> ToolResult;
}

/// A remote tool behind the local contract. Holds a manager handle and the
/// namespaced lookup key rather than an owning connection reference, so a
/// closed connection simply surfaces as a failed result.
pub struct McpTool {
    local_name: String,
    description: String,
    parameters: Value,
    manager: McpClientManager,
}

impl McpTool {
    pub fn from_namespaced(manager: McpClientManager, tool: NamespacedTool) -> Self {
        Self {
            local_name: tool.local_name,
            description: tool.description.unwrap_or_default(),
            parameters: tool.input_schema,
            manager,
        }
    }
}

#[async_trait]
impl AgentTool for McpTool {
    fn name(&self) -> &str {
        &self.local_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &Value {
        &self.parameters
    }

    async fn execute(&self, arguments: Map<String, Value>) -> ToolResult {
        let arguments = (!arguments.is_empty()).then_some(arguments);
        match self.manager.call_tool(&self.local_name, arguments).await {
            Ok(result) => render_call_result(&result),
            Err(err) => ToolResult::failure(err.to_string()),
        }
    }
}

/// Flattens a remote call result into the local shape: text blocks joined
/// line-wise, structured content pretty-printed as a fallback.
pub fn render_call_result(result: &CallToolResult) -> ToolResult {
    let mut parts = Vec::new();
    for block in &result.content {
        match block {
            ContentBlock::Text { text } => parts.push(text.clone()),
            ContentBlock::Image { mime_type, .. } => parts.push(format!("[image: {mime_type}]")),
            ContentBlock::Resource { resource } => {
                parts.push(pretty_json(resource));
            }
        }
    }
    let mut output = parts.join("\n");
    if output.is_empty() {
        if let Some(structured) = &result.structured_content {
            output = pretty_json(structured);
        }
    }

    if result.is_error.unwrap_or(false) {
        if output.is_empty() {
            output = "Tool reported an error.".to_string();
        }
        ToolResult::failure(output)
    } else {
        ToolResult::success(output)
    }
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|_| "Unable to serialize MCP result.".to_string())
}

/// Snapshot view of the manager's aggregated namespace as local tools.
/// Rebuild it after connections change or a list-changed refresh.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub async fn from_manager(manager: &McpClientManager) -> Self {
        let tools = manager
            .list_tools()
            .await
            .into_iter()
            .map(|tool| {
                let adapter: Arc<dyn AgentTool> =
                    Arc::new(McpTool::from_namespaced(manager.clone(), tool));
                (adapter.name().to_string(), adapter)
            })
            .collect();
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
