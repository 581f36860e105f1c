//! MCP (Model Context Protocol) client implementation
//!
//! Connects to tool servers that provide tools via JSON-RPC over stdio,
//! or via an equivalent HTTP endpoint surface.

mod client;
mod manager;
mod protocol;
mod schema;
mod tool;

pub use client::{McpClient, REQUEST_TIMEOUT, RpcError};
pub use manager::McpManager;
pub use protocol::*;
pub use schema::{FieldSpec, FieldType, InputSchema};
pub use tool::{McpTool, tool_definitions};
