//! Registry-facing wrappers around discovered MCP tools

use super::client::McpClient;
use super::protocol::McpToolDef;
use super::schema::InputSchema;
use crate::tool::{Tool, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A registered tool that proxies to its owning MCP server.
///
/// The registered name is `mcp_{server}_{tool}`, which keeps two servers
/// exposing the same tool name from colliding in the registry.
pub struct McpTool {
    name: String,
    description: String,
    tool_name: String,
    schema: InputSchema,
    client: Arc<McpClient>,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, def: McpToolDef) -> Self {
        let name = format!("mcp_{}_{}", client.name(), def.name);
        let description = format!(
            "[{}] {}",
            client.name(),
            def.description.as_deref().unwrap_or("MCP tool")
        );
        Self {
            name,
            description,
            tool_name: def.name,
            schema: InputSchema::translate(&def.input_schema),
            client,
        }
    }

    pub fn server_name(&self) -> &str {
        self.client.name()
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.schema.to_json_schema()
    }

    fn category(&self) -> &str {
        "mcp"
    }

    async fn execute(&self, input: Value) -> ToolResult {
        if let Err(reason) = self.schema.validate(&input) {
            return ToolResult::failure(format!(
                "invalid arguments for '{}': {}",
                self.name, reason
            ));
        }

        let input_repr = input.to_string();
        let result = self.client.call_tool(&self.tool_name, input).await;
        crate::logging::tool_call(
            &self.name,
            &input_repr,
            result.error.as_deref().unwrap_or(&result.output),
        );
        result
    }
}

/// Build registry definitions from a client's cached tool catalog. Pure
/// mapping over already-discovered tools; performs no I/O.
pub async fn tool_definitions(client: &Arc<McpClient>) -> Vec<McpTool> {
    client
        .tools()
        .await
        .into_iter()
        .map(|def| McpTool::new(Arc::clone(client), def))
        .collect()
}
