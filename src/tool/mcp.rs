//! MCP management tool - connect, disconnect, list, reload tool servers

use crate::mcp::{McpManager, McpServerConfig, ServerTransport};
use crate::tool::{PermissionTier, Registry, Tool, ToolResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct McpToolInput {
    action: String,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    token: Option<String>,
}

pub struct McpManagementTool {
    manager: Arc<McpManager>,
    registry: Option<Registry>,
}

impl McpManagementTool {
    pub fn new(manager: Arc<McpManager>) -> Self {
        Self {
            manager,
            registry: None,
        }
    }

    /// Attach a registry so connect/disconnect/reload keep registered
    /// tools in sync
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn manager(&self) -> &Arc<McpManager> {
        &self.manager
    }

    async fn list_servers(&self) -> ToolResult {
        let names = self.manager.server_names().await;
        if names.is_empty() {
            return ToolResult::ok("No MCP servers configured.");
        }

        let mut lines = Vec::new();
        for name in names {
            let Some(client) = self.manager.get_client(&name).await else {
                continue;
            };
            if client.connected() {
                let tools = client.tools().await;
                let version = client
                    .server_info()
                    .await
                    .and_then(|info| info.version)
                    .unwrap_or_else(|| "unknown".to_string());
                lines.push(format!(
                    "{} - connected (server version {}, {} tool(s))",
                    name,
                    version,
                    tools.len()
                ));
                for tool in tools {
                    lines.push(format!("  mcp_{}_{}", name, tool.name));
                }
            } else if client.config().lazy {
                lines.push(format!("{} - lazy, not connected", name));
            } else {
                lines.push(format!("{} - not connected", name));
            }
        }
        ToolResult::ok(lines.join("\n"))
    }

    async fn connect_server(&self, params: McpToolInput) -> ToolResult {
        let Some(name) = params.server else {
            return ToolResult::failure("'server' is required for connect");
        };

        let transport = match (params.command, params.url) {
            (Some(command), None) => ServerTransport::Command {
                command,
                args: params.args.unwrap_or_default(),
                env: params.env.unwrap_or_default(),
            },
            (None, Some(url)) => ServerTransport::Http {
                url,
                token: params.token,
            },
            _ => {
                return ToolResult::failure(
                    "connect requires exactly one of 'command' or 'url'",
                );
            }
        };

        let config = McpServerConfig {
            transport,
            lazy: false,
        };

        match self.manager.connect_server(&name, config).await {
            Ok(tools) => {
                let count = tools.len();
                if let Some(registry) = &self.registry {
                    for tool in tools {
                        let _ = registry.register(Arc::new(tool)).await;
                    }
                }
                ToolResult::ok(format!(
                    "Connected to '{}' ({} tool(s) available)",
                    name, count
                ))
            }
            Err(e) => ToolResult::failure(format!("connect failed: {:#}", e)),
        }
    }

    async fn disconnect_server(&self, params: McpToolInput) -> ToolResult {
        let Some(name) = params.server else {
            return ToolResult::failure("'server' is required for disconnect");
        };

        match self.manager.disconnect_server(&name).await {
            Ok(()) => {
                if let Some(registry) = &self.registry {
                    registry.unregister_prefix(&format!("mcp_{}_", name)).await;
                }
                ToolResult::ok(format!("Disconnected '{}'", name))
            }
            Err(e) => ToolResult::failure(format!("disconnect failed: {:#}", e)),
        }
    }

    async fn reload_config(&self) -> ToolResult {
        if let Some(registry) = &self.registry {
            registry.unregister_prefix("mcp_").await;
        }

        let (successes, failures) = self.manager.reload().await;

        if let Some(registry) = &self.registry {
            self.manager.register_tools(registry).await;
        }

        let mut summary = format!("Reloaded: {} server(s) connected", successes);
        for (name, error) in failures {
            summary.push_str(&format!("\n{} failed: {}", name, error));
        }
        ToolResult::ok(summary)
    }
}

#[async_trait]
impl Tool for McpManagementTool {
    fn name(&self) -> &str {
        "mcp"
    }

    fn description(&self) -> &str {
        "Manage MCP tool servers. Connect to new servers, disconnect, list configured servers and their tools, or reload configuration."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "connect", "disconnect", "reload"],
                    "description": "Action to perform: 'list' shows configured servers and their tools, 'connect' adds a new server, 'disconnect' removes a server, 'reload' reloads from config files"
                },
                "server": {
                    "type": "string",
                    "description": "Server name (required for connect/disconnect)"
                },
                "command": {
                    "type": "string",
                    "description": "Command to run a stdio server (connect only)"
                },
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Arguments to pass to the command (optional)"
                },
                "env": {
                    "type": "object",
                    "additionalProperties": {"type": "string"},
                    "description": "Environment variables for the server (optional)"
                },
                "url": {
                    "type": "string",
                    "description": "Base URL of an HTTP server (connect only)"
                },
                "token": {
                    "type": "string",
                    "description": "Bearer token for an HTTP server (optional)"
                }
            },
            "required": ["action"]
        })
    }

    fn permission_tier(&self) -> PermissionTier {
        PermissionTier::Privileged
    }

    fn category(&self) -> &str {
        "mcp"
    }

    async fn execute(&self, input: Value) -> ToolResult {
        let params: McpToolInput = match serde_json::from_value(input) {
            Ok(params) => params,
            Err(e) => return ToolResult::failure(format!("invalid input: {}", e)),
        };

        match params.action.as_str() {
            "list" => self.list_servers().await,
            "connect" => self.connect_server(params).await,
            "disconnect" => self.disconnect_server(params).await,
            "reload" => self.reload_config().await,
            other => ToolResult::failure(format!(
                "Unknown action: {}. Use 'list', 'connect', 'disconnect', or 'reload'.",
                other
            )),
        }
    }
}
