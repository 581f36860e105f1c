//! Tool registry boundary
//!
//! The assistant's agent loop executes tools through this registry. MCP
//! servers contribute tools dynamically at connect time; everything here is
//! keyed by the tool's fully-qualified registered name.

pub mod mcp;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outcome of a tool invocation. Failures are data, not errors: the
/// caller relays them to the user or the model as text.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            is_error: true,
            error: Some(message.into()),
        }
    }
}

/// How much scrutiny an invocation deserves before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionTier {
    ReadOnly,
    Standard,
    Privileged,
}

/// A tool that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registered name (must be unique across the registry)
    fn name(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str;

    /// JSON Schema for the input parameters
    fn input_schema(&self) -> Value;

    fn permission_tier(&self) -> PermissionTier {
        PermissionTier::Standard
    }

    fn category(&self) -> &str {
        "general"
    }

    /// Execute the tool with the given input
    async fn execute(&self, input: Value) -> ToolResult;
}

/// Tool definition in the shape the model API expects
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub permission_tier: PermissionTier,
    pub category: String,
}

/// Registry of available tools (Arc-wrapped for sharing)
#[derive(Clone, Default)]
pub struct Registry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. The first registrant for a name wins; a duplicate
    /// is an error the caller may choose to ignore.
    pub async fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            bail!("tool '{}' is already registered", name);
        }
        tools.insert(name, tool);
        Ok(())
    }

    /// Unregister a tool
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.write().await.remove(name)
    }

    /// Unregister all tools matching a prefix; returns the removed names
    pub async fn unregister_prefix(&self, prefix: &str) -> Vec<String> {
        let mut tools = self.tools.write().await;
        let to_remove: Vec<String> = tools
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for name in &to_remove {
            tools.remove(name);
        }
        to_remove
    }

    /// All tool definitions, sorted by name for deterministic ordering
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
                permission_tier: tool.permission_tier(),
                category: tool.category().to_string(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    /// Execute a tool by name
    pub async fn execute(&self, name: &str, input: Value) -> Result<ToolResult> {
        let tool = {
            let tools = self.tools.read().await;
            tools
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown tool: {}", name))?
        };
        Ok(tool.execute(input).await)
    }
}
