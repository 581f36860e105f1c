//! MCP client - owns the connection to a single tool server
//!
//! Command servers are child processes speaking newline-delimited JSON-RPC
//! over stdio; responses are correlated to requests by id, so any number of
//! calls may be in flight at once. Http servers are stateless endpoints
//! probed once at connect time.

use super::protocol::*;
use crate::tool::ToolResult;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

/// Upper bound on a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Protocol-level request failures. Timeouts are a distinct kind so
/// callers can tell an unresponsive server from a dead one.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("connection closed before response arrived")]
    ConnectionClosed,
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Runtime handles for an established command-variant connection
#[derive(Default)]
struct ConnState {
    child: Option<Child>,
    writer_tx: Option<mpsc::Sender<String>>,
}

/// Client for a single configured tool server
pub struct McpClient {
    name: String,
    config: McpServerConfig,
    http: reqwest::Client,
    conn: Mutex<ConnState>,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    pending: PendingMap,
    tools: Arc<RwLock<Vec<McpToolDef>>>,
    server_info: RwLock<Option<ServerInfo>>,
}

impl McpClient {
    /// Create an unconnected client. No I/O happens until `connect`.
    pub fn new(name: impl Into<String>, config: McpServerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            http: reqwest::Client::new(),
            conn: Mutex::new(ConnState::default()),
            connected: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            tools: Arc::new(RwLock::new(Vec::new())),
            server_info: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last discovered tool list
    pub async fn tools(&self) -> Vec<McpToolDef> {
        self.tools.read().await.clone()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    /// Establish the connection. A no-op when already connected, so lazy
    /// servers can call this on every use.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if self.connected() {
            return Ok(());
        }

        match &self.config.transport {
            ServerTransport::Command { command, args, env } => {
                self.connect_command(&mut conn, command, args, env).await
            }
            ServerTransport::Http { url, token } => {
                self.connect_http(url, token.as_deref()).await
            }
        }
    }

    /// Spawn the subprocess, wire up reader/writer tasks, and perform the
    /// initialize handshake.
    async fn connect_command(
        &self,
        conn: &mut ConnState,
        command: &str,
        args: &[String],
        extra_env: &HashMap<String, String>,
    ) -> Result<()> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(extra_env.clone());

        let mut child = Command::new(command)
            .args(args)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn MCP server '{}' ({})", self.name, command))?;

        let stdin = child.stdin.take().context("no stdin pipe")?;
        let stdout = child.stdout.take().context("no stdout pipe")?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(32);

        // Writer task. On a broken pipe the pending map is drained so
        // waiters fail fast instead of running out the timeout.
        let mut stdin = stdin;
        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if stdin.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            connected.store(false, Ordering::SeqCst);
            pending.lock().await.clear();
        });

        // Reader task: buffers stdout and dispatches each complete line.
        // EOF doubles as the process-exit observer.
        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let tools = Arc::clone(&self.tools);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => dispatch_line(line.trim(), &pending).await,
                    Err(_) => break,
                }
            }
            connected.store(false, Ordering::SeqCst);
            pending.lock().await.clear();
            tools.write().await.clear();
        });

        conn.child = Some(child);
        conn.writer_tx = Some(writer_tx.clone());

        if let Err(e) = self.handshake(&writer_tx).await {
            if let Some(mut child) = conn.child.take() {
                let _ = child.kill().await;
            }
            conn.writer_tx = None;
            self.pending.lock().await.clear();
            return Err(e).with_context(|| format!("handshake with '{}' failed", self.name));
        }

        self.connected.store(true, Ordering::SeqCst);
        crate::logging::info(&format!("connected to MCP server '{}'", self.name));
        Ok(())
    }

    async fn handshake(&self, writer_tx: &mpsc::Sender<String>) -> Result<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: "toolbus".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        let response = self
            .request_with(writer_tx, "initialize", Some(serde_json::to_value(params)?))
            .await?;

        if let Some(result) = response.result {
            if let Ok(init) = serde_json::from_value::<InitializeResult>(result) {
                *self.server_info.write().await = init.server_info;
            }
        }

        send_notification(writer_tx, "notifications/initialized", Some(json!({}))).await?;
        Ok(())
    }

    /// Reachability probe for http servers
    async fn connect_http(&self, url: &str, token: Option<&str>) -> Result<()> {
        let mut request = self.http.get(url);
        if let Some(token) = token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("probe of MCP server '{}' ({}) failed", self.name, url))?;

        if !response.status().is_success() {
            bail!(
                "probe of MCP server '{}' returned {}",
                self.name,
                response.status()
            );
        }

        self.connected.store(true, Ordering::SeqCst);
        crate::logging::info(&format!("connected to MCP server '{}'", self.name));
        Ok(())
    }

    /// Send a request over the established command connection
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, RpcError> {
        let writer_tx = {
            let conn = self.conn.lock().await;
            conn.writer_tx.clone().ok_or(RpcError::ConnectionClosed)?
        };
        self.request_with(&writer_tx, method, params).await
    }

    async fn request_with(
        &self,
        writer_tx: &mpsc::Sender<String>,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)? + "\n";

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if writer_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        await_response(rx, id, &self.pending, REQUEST_TIMEOUT).await
    }

    /// Ask the server for its tool catalog, caching the result. An absent
    /// or malformed `tools` field is treated as an empty catalog.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        self.connect().await?;

        let tools = match &self.config.transport {
            ServerTransport::Command { .. } => {
                let response = self
                    .request("tools/list", None)
                    .await
                    .with_context(|| format!("tools/list on '{}' failed", self.name))?;
                response
                    .result
                    .and_then(|result| serde_json::from_value::<ToolsListResult>(result).ok())
                    .map(|list| list.tools)
                    .unwrap_or_default()
            }
            ServerTransport::Http { url, token } => {
                let response = authorized(self.http.get(endpoint(url, "tools/list")), token)
                    .send()
                    .await
                    .with_context(|| format!("tools/list on '{}' failed", self.name))?;
                if !response.status().is_success() {
                    bail!("tools/list on '{}' returned {}", self.name, response.status());
                }
                let body: Value = response.json().await?;
                body.get("tools")
                    .cloned()
                    .and_then(|tools| serde_json::from_value(tools).ok())
                    .unwrap_or_default()
            }
        };

        *self.tools.write().await = tools.clone();
        Ok(tools)
    }

    /// Invoke a tool on the server. Never fails: every transport or
    /// protocol error is folded into an error-flagged result that the
    /// caller relays as text.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> ToolResult {
        match self.try_call(tool, arguments).await {
            Ok(result) => result,
            Err(e) => ToolResult::failure(format!("tool call '{}' failed: {:#}", tool, e)),
        }
    }

    async fn try_call(&self, tool: &str, arguments: Value) -> Result<ToolResult> {
        self.connect().await?;

        let params = ToolCallParams {
            name: tool.to_string(),
            arguments,
        };

        let raw = match &self.config.transport {
            ServerTransport::Command { .. } => {
                let response = self
                    .request("tools/call", Some(serde_json::to_value(&params)?))
                    .await?;
                let result = response.result.context("tool call returned no result")?;
                serde_json::from_value::<ToolCallResult>(result)?
            }
            ServerTransport::Http { url, token } => {
                let response = authorized(self.http.post(endpoint(url, "tools/call")), token)
                    .json(&params)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    bail!("server returned {}", response.status());
                }
                response.json::<ToolCallResult>().await?
            }
        };

        Ok(normalize_result(raw))
    }

    /// Tear down the connection. Safe to call repeatedly or while
    /// unconnected.
    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;

        if let Some(writer_tx) = conn.writer_tx.take() {
            // Give the server a chance to exit on its own before the kill
            let _ = send_notification(&writer_tx, "shutdown", None).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(mut child) = conn.child.take() {
            let _ = child.kill().await;
        }

        self.connected.store(false, Ordering::SeqCst);
        self.tools.write().await.clear();
        self.pending.lock().await.clear();
        *self.server_info.write().await = None;
    }

    #[cfg(test)]
    pub(crate) async fn set_cached_tools(&self, tools: Vec<McpToolDef>) {
        *self.tools.write().await = tools;
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // Best effort cleanup
        if let Ok(mut conn) = self.conn.try_lock() {
            if let Some(child) = conn.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Route one stdout line to the matching pending request. Lines that are
/// not JSON, carry no id, or match nothing are dropped: servers are free
/// to write diagnostics and notifications to the same stream.
async fn dispatch_line(line: &str, pending: &PendingMap) {
    if line.is_empty() {
        return;
    }
    let Ok(response) = serde_json::from_str::<JsonRpcResponse>(line) else {
        return;
    };
    let Some(id) = response.id else {
        return;
    };
    let sender = pending.lock().await.remove(&id);
    if let Some(tx) = sender {
        let _ = tx.send(response);
    }
}

/// Wait for the correlated response. On timeout the pending entry is
/// removed, so a late response is simply unmatched and discarded.
async fn await_response(
    rx: oneshot::Receiver<JsonRpcResponse>,
    id: u64,
    pending: &PendingMap,
    timeout: Duration,
) -> Result<JsonRpcResponse, RpcError> {
    match tokio::time::timeout(timeout, rx).await {
        Err(_) => {
            pending.lock().await.remove(&id);
            Err(RpcError::Timeout(timeout))
        }
        Ok(Err(_)) => Err(RpcError::ConnectionClosed),
        Ok(Ok(response)) => match response.error {
            Some(err) => Err(RpcError::Server {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response),
        },
    }
}

async fn send_notification(
    writer_tx: &mpsc::Sender<String>,
    method: &str,
    params: Option<Value>,
) -> Result<(), RpcError> {
    let note = JsonRpcRequest::notification(method, params);
    let line = serde_json::to_string(&note)? + "\n";
    writer_tx
        .send(line)
        .await
        .map_err(|_| RpcError::ConnectionClosed)
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn authorized(request: reqwest::RequestBuilder, token: &Option<String>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.header("Authorization", format!("Bearer {}", token)),
        None => request,
    }
}

/// Collapse a wire result into the registry's result shape: text blocks
/// joined by newlines, with the server's error flag carried through.
fn normalize_result(result: ToolCallResult) -> ToolResult {
    let text = result
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    if result.is_error {
        ToolResult {
            output: text.clone(),
            is_error: true,
            error: Some(text),
        }
    } else {
        ToolResult::ok(text)
    }
}
