//! MCP server: JSON-RPC dispatch and the stdio transport.
//!
//! Lifecycle requests are handled in arrival order. `tools/call` requests run
//! as separate tasks so a slow navigation does not hold up other pages; their
//! responses are written as they complete. When the client sends `shutdown`,
//! `exit`, or closes stdin, in-flight calls are awaited and every page is
//! closed before the server returns.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{codes, Result};
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcId, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, McpMessage, ServerCapabilities, ServerInfo, ToolCallParams, ToolsCapability,
};
use crate::tools::ToolRegistry;

/// MCP protocol version.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name.
pub const SERVER_NAME: &str = "pagekeeper-mcp";

/// Server version.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// MCP server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialization.
    Uninitialized,
    /// Server is initialized and ready.
    Ready,
    /// Server is shutting down.
    ShuttingDown,
}

/// MCP server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct McpServer {
    state: Arc<RwLock<ServerState>>,
    tools: Arc<ToolRegistry>,
}

impl McpServer {
    /// Serve the given tools.
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState::Uninitialized)),
            tools: Arc::new(tools),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Run the server on stdio.
    pub async fn run_stdio(&self) -> Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Run the server over any line-oriented transport.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("MCP server starting");

        let (tx, rx) = mpsc::channel::<JsonRpcResponse>(64);
        let writer = tokio::spawn(write_responses(rx, output));
        let mut calls = JoinSet::new();
        let mut lines = BufReader::new(input).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "stdin read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!(message = %line, "received");

            let response = match McpMessage::parse(&line) {
                Ok(McpMessage::Request(request)) if request.method == "tools/call" => {
                    let server = self.clone();
                    let tx = tx.clone();
                    calls.spawn(async move {
                        let response = server.handle_request(request).await;
                        if tx.send(response).await.is_err() {
                            warn!("response dropped, writer is gone");
                        }
                    });
                    None
                }
                Ok(message) => self.dispatch(message).await,
                Err(e) => Some(JsonRpcResponse::from_error(None, &e)),
            };
            if let Some(response) = response {
                if tx.send(response).await.is_err() {
                    break;
                }
            }

            // Reap finished calls so the set does not grow without bound.
            while calls.try_join_next().is_some() {}

            if self.state().await == ServerState::ShuttingDown {
                break;
            }
        }

        while let Some(joined) = calls.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "tool call task failed");
            }
        }
        drop(tx);
        match writer.await {
            Ok(Err(e)) => warn!(error = %e, "writing responses failed"),
            Err(e) => warn!(error = %e, "response writer task failed"),
            Ok(Ok(())) => {}
        }

        *self.state.write().await = ServerState::ShuttingDown;
        self.close_pages().await;
        info!("MCP server shutting down");
        Ok(())
    }

    /// Close every page and release the browser.
    pub async fn close_pages(&self) {
        if let Err(e) = self.tools.context().sessions.shutdown().await {
            warn!(error = %e, "browser shutdown failed");
        }
    }

    /// Handle one incoming line. Returns the response, if one is due.
    pub async fn handle_message(&self, json: &str) -> Option<JsonRpcResponse> {
        match McpMessage::parse(json) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Some(JsonRpcResponse::from_error(None, &e)),
        }
    }

    async fn dispatch(&self, message: McpMessage) -> Option<JsonRpcResponse> {
        match message {
            McpMessage::Request(request) => Some(self.handle_request(request).await),
            McpMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                None
            }
            // We don't expect responses in this direction
            McpMessage::Response(_) => None,
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, request.params).await,
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, request.params).await,
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "shutdown" => {
                *self.state.write().await = ServerState::ShuttingDown;
                JsonRpcResponse::success(id, serde_json::json!({}))
            }
            _ => JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            ),
        }
    }

    async fn handle_notification(&self, notification: JsonRpcRequest) {
        match notification.method.as_str() {
            "notifications/initialized" => info!("client initialized"),
            "notifications/cancelled" => {
                debug!(params = ?notification.params, "request cancelled by client");
            }
            "exit" => *self.state.write().await = ServerState::ShuttingDown,
            other => debug!(method = other, "unknown notification"),
        }
    }

    async fn handle_initialize(&self, id: Option<JsonRpcId>, params: Option<Value>) -> JsonRpcResponse {
        let params: InitializeParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid initialize params: {e}"),
                );
            }
            None => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "initialize params required");
            }
        };

        if params.protocol_version != PROTOCOL_VERSION {
            debug!(
                requested = %params.protocol_version,
                offered = PROTOCOL_VERSION,
                "protocol version differs"
            );
        }
        if let Some(client) = &params.client_info {
            info!(client = %client.name, version = %client.version, "initializing");
        }

        *self.state.write().await = ServerState::Ready;

        JsonRpcResponse::success(
            id,
            InitializeResult {
                protocol_version: PROTOCOL_VERSION.into(),
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability { list_changed: false }),
                },
                server_info: ServerInfo {
                    name: SERVER_NAME.into(),
                    version: SERVER_VERSION.into(),
                },
            },
        )
    }

    async fn handle_tools_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if self.state().await != ServerState::Ready {
            return JsonRpcResponse::error(id, codes::INTERNAL_ERROR, "server not initialized");
        }

        JsonRpcResponse::success(
            id,
            ListToolsResult {
                tools: self.tools.list_tools(),
            },
        )
    }

    async fn handle_tools_call(&self, id: Option<JsonRpcId>, params: Option<Value>) -> JsonRpcResponse {
        if self.state().await != ServerState::Ready {
            return JsonRpcResponse::error(id, codes::INTERNAL_ERROR, "server not initialized");
        }

        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid tool call params: {e}"),
                );
            }
            None => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "tool call params required");
            }
        };

        debug!(tool = %params.name, "calling tool");
        match self.tools.execute(&params.name, params.arguments).await {
            Ok(result) => {
                if result.is_error {
                    warn!(tool = %params.name, "tool reported an error");
                }
                JsonRpcResponse::success(id, result)
            }
            Err(e) => {
                error!(tool = %params.name, error = %e, "tool failed");
                JsonRpcResponse::from_error(id, &e)
            }
        }
    }
}

async fn write_responses<W>(mut rx: mpsc::Receiver<JsonRpcResponse>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let json = serde_json::to_string(&response)?;
        debug!(message = %json, "sending");
        output.write_all(json.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
