//! MCP manager - owns the full set of configured tool servers
//!
//! Bulk operations fan out per server and tolerate individual failures:
//! an assistant with several optional tool servers should start with
//! whatever subset is actually reachable.

use super::client::McpClient;
use super::protocol::{McpConfig, McpServerConfig};
use super::tool::{self, McpTool};
use crate::tool::{Registry, Tool};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Manages one [`McpClient`] per configured server
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    /// Guards config loading so it happens once per manager (or once per
    /// reload), and remembers where to look on reload.
    load_state: Mutex<LoadState>,
}

#[derive(Default)]
struct LoadState {
    loaded: bool,
    working_dir: Option<PathBuf>,
}

impl McpManager {
    /// Create an empty manager; config is loaded on first use
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            load_state: Mutex::new(LoadState::default()),
        }
    }

    /// Create a manager with a specific config, bypassing file loading
    pub fn with_config(config: McpConfig) -> Self {
        let clients = config
            .servers
            .into_iter()
            .map(|(name, server)| {
                let client = Arc::new(McpClient::new(name.clone(), server));
                (name, client)
            })
            .collect();
        Self {
            clients: RwLock::new(clients),
            load_state: Mutex::new(LoadState {
                loaded: true,
                working_dir: None,
            }),
        }
    }

    /// Load configuration from the candidate file paths and create a
    /// client for each server not already present (first-seen wins).
    /// Idempotent; a malformed file never prevents startup.
    pub async fn load_config(&self, working_dir: Option<&Path>) {
        let mut state = self.load_state.lock().await;
        if state.loaded {
            return;
        }

        let config = McpConfig::load(working_dir);
        let mut clients = self.clients.write().await;
        for (name, server) in config.servers {
            if !clients.contains_key(&name) {
                clients.insert(name.clone(), Arc::new(McpClient::new(name, server)));
            }
        }

        state.loaded = true;
        state.working_dir = working_dir.map(Path::to_path_buf);
    }

    /// Connect every non-lazy server and discover its tools, in parallel.
    /// Returns (successes, failures); failures are logged and never
    /// propagate, because partial availability is the expected steady
    /// state.
    pub async fn connect_all(&self) -> (usize, Vec<(String, String)>) {
        self.load_config(None).await;

        let targets: Vec<Arc<McpClient>> = self
            .clients
            .read()
            .await
            .values()
            .filter(|client| !client.config().lazy)
            .cloned()
            .collect();

        let mut tasks = Vec::new();
        for client in targets {
            tasks.push(tokio::spawn(async move {
                let name = client.name().to_string();
                let result = async {
                    client.connect().await?;
                    client.list_tools().await?;
                    anyhow::Ok(())
                }
                .await;
                (name, result)
            }));
        }

        let mut successes = 0;
        let mut failures = Vec::new();
        for task in tasks {
            match task.await {
                Ok((_name, Ok(()))) => successes += 1,
                Ok((name, Err(e))) => {
                    let message = format!("{:#}", e);
                    crate::logging::warn(&format!(
                        "MCP server '{}' unavailable: {}",
                        name, message
                    ));
                    failures.push((name, message));
                }
                Err(e) => {
                    crate::logging::warn(&format!("MCP connection task panicked: {}", e));
                }
            }
        }

        (successes, failures)
    }

    /// Registry definitions for every tool on every currently-connected
    /// server. Disconnected and never-used lazy servers contribute
    /// nothing.
    pub async fn all_tools(&self) -> Vec<McpTool> {
        let clients = self.clients.read().await;
        let mut tools = Vec::new();
        for client in clients.values() {
            if client.connected() {
                tools.extend(tool::tool_definitions(client).await);
            }
        }
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Register every aggregated tool. A name collision means someone
    /// else registered first; skip it.
    pub async fn register_tools(&self, registry: &Registry) {
        for tool in self.all_tools().await {
            let name = tool.name().to_string();
            if let Err(e) = registry.register(Arc::new(tool)).await {
                crate::logging::debug(&format!("skipping MCP tool '{}': {:#}", name, e));
            }
        }
    }

    /// Look up a client by server name (the lazy first-use path)
    pub async fn get_client(&self, name: &str) -> Option<Arc<McpClient>> {
        self.clients.read().await.get(name).cloned()
    }

    /// Configured server names
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of currently-connected servers
    pub async fn connected_servers(&self) -> Vec<String> {
        let clients = self.clients.read().await;
        let mut names: Vec<String> = clients
            .iter()
            .filter(|(_, client)| client.connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn has_connections(&self) -> bool {
        self.clients
            .read()
            .await
            .values()
            .any(|client| client.connected())
    }

    /// Add a server at runtime, connect it, and discover its tools.
    /// An already-configured name keeps its existing definition.
    pub async fn connect_server(
        &self,
        name: &str,
        config: McpServerConfig,
    ) -> Result<Vec<McpTool>> {
        let client = {
            let mut clients = self.clients.write().await;
            clients
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(McpClient::new(name, config)))
                .clone()
        };

        client
            .connect()
            .await
            .with_context(|| format!("failed to connect to MCP server '{}'", name))?;
        client.list_tools().await?;
        Ok(tool::tool_definitions(&client).await)
    }

    /// Disconnect a server and drop it from the managed set
    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let client = self
            .clients
            .write()
            .await
            .remove(name)
            .with_context(|| format!("MCP server '{}' is not configured", name))?;
        client.disconnect().await;
        Ok(())
    }

    /// Disconnect every owned client concurrently. Used at shutdown so no
    /// orphaned subprocesses remain.
    pub async fn disconnect_all(&self) {
        let clients: Vec<Arc<McpClient>> = self.clients.read().await.values().cloned().collect();
        futures::future::join_all(clients.iter().map(|client| client.disconnect())).await;
    }

    /// Disconnect everything, re-read config, and reconnect
    pub async fn reload(&self) -> (usize, Vec<(String, String)>) {
        self.disconnect_all().await;

        let working_dir = {
            let mut state = self.load_state.lock().await;
            state.loaded = false;
            self.clients.write().await.clear();
            state.working_dir.take()
        };

        self.load_config(working_dir.as_deref()).await;
        self.connect_all().await
    }
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}
