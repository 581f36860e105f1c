//! toolbus — connects an assistant to external MCP tool servers.
//!
//! Tool servers are either local subprocesses speaking newline-delimited
//! JSON-RPC over stdio, or remote HTTP services exposing the same
//! discovery/invocation methods as endpoints. Discovered tools are
//! translated into typed definitions and registered into the host's
//! tool registry under globally unique names.

pub mod logging;
pub mod mcp;
pub mod tool;
