//! MCP client session over a pair of message channels.
//!
//! Handles the MCP protocol handshake (initialize + initialized notification),
//! tool discovery (tools/list), and tool invocation (tools/call). Responses are
//! matched to requests by id in a background dispatch task, which also answers
//! requests the server sends us.

use crate::error::McpError;
use crate::jsonrpc::{
    JsonRpcNotification, JsonRpcReply, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
    OutgoingMessage,
};
use crate::transport::{ReadChannel, WriteChannel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::WeakSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server identity reported by the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Snapshot of the tools a server exposed at connect time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl<'a> IntoIterator for &'a ToolCatalog {
    type Item = &'a ToolDescriptor;
    type IntoIter = std::slice::Iter<'a, ToolDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tools.iter()
    }
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: serde_json::Value,
    },
    /// A part of a kind this client does not model.
    #[serde(other)]
    Other,
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Result of calling a tool on an MCP server.
#[derive(Debug, Clone, PartialEq)]
pub struct CallToolResult {
    pub content: Vec<Content>,
    pub is_error: bool,
    /// The result object exactly as the server sent it.
    pub raw: serde_json::Value,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    #[serde(default)]
    content: Vec<Content>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    /// Parse a `tools/call` result object.
    pub fn from_value(raw: serde_json::Value) -> Result<Self, McpError> {
        let payload: ToolCallPayload = serde_json::from_value(raw.clone())
            .map_err(|e| McpError::Protocol(format!("Failed to parse tools/call result: {e}")))?;
        Ok(Self {
            content: payload.content,
            is_error: payload.is_error,
            raw,
        })
    }
}

impl fmt::Display for CallToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsListPage {
    tools: Vec<ToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Removes a pending request if its caller stops waiting.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// An established protocol conversation with one server.
pub struct ClientSession {
    server: String,
    next_id: AtomicU64,
    write_tx: Mutex<Option<WriteChannel>>,
    pending: Arc<Mutex<PendingMap>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    server_info: Mutex<Option<InitializeResult>>,
}

impl ClientSession {
    /// Start a session over the given channels.
    ///
    /// Spawns the dispatch task, so it must be called from within a runtime.
    pub fn new(server: impl Into<String>, read: ReadChannel, write: WriteChannel) -> Arc<Self> {
        let server = server.into();
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let dispatch = tokio::spawn(dispatch(
            server.clone(),
            read,
            write.downgrade(),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Arc::new(Self {
            server,
            next_id: AtomicU64::new(1),
            write_tx: Mutex::new(Some(write)),
            pending,
            dispatch: Mutex::new(Some(dispatch)),
            closed,
            server_info: Mutex::new(None),
        })
    }

    /// The configured name of the server this session talks to.
    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// What the server reported during the handshake, once it has completed.
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    fn closed_error(&self) -> McpError {
        McpError::ConnectionClosed {
            server: self.server.clone(),
        }
    }

    fn writer(&self) -> Result<WriteChannel, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        lock(&self.write_tx).clone().ok_or_else(|| self.closed_error())
    }

    /// Send a request and wait for its result.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let writer = self.writer()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        writer
            .send(OutgoingMessage::Request(JsonRpcRequest::new(id, method, params)))
            .await
            .map_err(|_| self.closed_error())?;

        let resp = rx.await.map_err(|_| self.closed_error())?;

        if let Some(err) = resp.error {
            return Err(McpError::JsonRpc {
                server: self.server.clone(),
                code: err.code,
                message: err.message,
            });
        }
        resp.result.ok_or_else(|| {
            McpError::Protocol(format!("{method} response has neither result nor error"))
        })
    }

    /// Send a notification (fire-and-forget, no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.writer()?
            .send(OutgoingMessage::Notification(JsonRpcNotification::new(
                method, params,
            )))
            .await
            .map_err(|_| self.closed_error())
    }

    /// Perform the `initialize` handshake.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "tether",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.request("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("Failed to parse initialize response: {e}")))?;

        self.notify("notifications/initialized", None).await?;

        tracing::debug!(
            "MCP server '{}' is {} {} (protocol {})",
            self.server,
            init.server_info.name,
            init.server_info.version,
            init.protocol_version
        );
        *lock(&self.server_info) = Some(init.clone());
        Ok(init)
    }

    /// Discover tools via `tools/list`, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ToolsListPage = serde_json::from_value(result).map_err(|e| {
                McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
            })?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Call a tool on this server.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", Some(params)).await?;
        CallToolResult::from_value(result)
    }

    /// Close the session: stop writing, stop dispatching, fail waiters.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let writer = lock(&self.write_tx).take();
        let dispatch = lock(&self.dispatch).take();
        if writer.is_none() && dispatch.is_none() {
            return;
        }
        if let Some(handle) = dispatch {
            handle.abort();
        }
        lock(&self.pending).clear();
        tracing::debug!("MCP session with '{}' closed", self.server);
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("server", &self.server)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Route incoming messages to their waiting requests.
async fn dispatch(
    server: String,
    mut read: ReadChannel,
    reply: WeakSender<OutgoingMessage>,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = read.recv().await {
        match (msg.id, msg.method.as_deref()) {
            (Some(id), Some(method)) => answer_server_request(&server, &reply, id, method).await,
            (Some(id), None) => {
                if let Some(tx) = lock(&pending).remove(&id) {
                    let _ = tx.send(msg);
                } else {
                    tracing::debug!("Dropping response {id} from '{server}' with no waiter");
                }
            }
            (None, Some(method)) => {
                tracing::debug!("Notification from '{server}': {method}");
            }
            (None, None) => {
                tracing::warn!("Ignoring message from '{server}' with neither id nor method");
            }
        }
    }
    tracing::debug!("MCP server '{server}' closed its message stream");
    closed.store(true, Ordering::Release);
    lock(&pending).clear();
}

/// Answer a request the server sent us. Only `ping` is supported.
///
/// Server ids are independent of ours, so the pending map is never consulted.
async fn answer_server_request(
    server: &str,
    reply: &WeakSender<OutgoingMessage>,
    id: u64,
    method: &str,
) {
    let response = if method == "ping" {
        JsonRpcReply::result(id, serde_json::json!({}))
    } else {
        tracing::debug!("Rejecting '{method}' request {id} from '{server}'");
        JsonRpcReply::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    };
    // The session has closed its writer; nobody is listening any more
    let Some(write) = reply.upgrade() else {
        return;
    };
    if write.send(OutgoingMessage::Response(response)).await.is_err() {
        tracing::debug!("Could not answer '{method}' request {id} from '{server}'");
    }
}
