//! Error types for MCP operations.

use std::fmt;
use thiserror::Error;

/// The stage of a connection's lifecycle an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Launch,
    Handshake,
    Discovery,
    ToolCall,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Launch => "launch",
            Phase::Handshake => "handshake",
            Phase::Discovery => "discovery",
            Phase::ToolCall => "tool call",
        };
        f.write_str(name)
    }
}

/// Errors from MCP server communication.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP is not enabled in configuration")]
    NotEnabled,

    #[error("No MCP server config found for '{name}'")]
    ServerNotFound { name: String },

    #[error("Failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Handshake with MCP server '{server}' failed: {reason}")]
    Handshake { server: String, reason: String },

    #[error("Tool discovery on MCP server '{server}' failed: {reason}")]
    Discovery { server: String, reason: String },

    #[error("MCP server '{server}' timed out during {phase} after {timeout_ms}ms")]
    Timeout {
        server: String,
        phase: Phase,
        timeout_ms: u64,
    },

    #[error("Not connected to an MCP server")]
    NotConnected,

    #[error("Tool call '{tool}' failed: {reason}")]
    ToolCall { tool: String, reason: String },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("Connection to MCP server '{server}' is closed")]
    ConnectionClosed { server: String },

    #[error("Failed to start event loop: {0}")]
    Runtime(std::io::Error),

    #[error("Event loop cannot be driven from inside an async context")]
    Reentrant,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// The lifecycle phase this error was raised in, if it belongs to one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            McpError::NotEnabled | McpError::ServerNotFound { .. } => Some(Phase::Config),
            McpError::SpawnFailed { .. } => Some(Phase::Launch),
            McpError::Handshake { .. } => Some(Phase::Handshake),
            McpError::Discovery { .. } => Some(Phase::Discovery),
            McpError::Timeout { phase, .. } => Some(*phase),
            McpError::NotConnected | McpError::ToolCall { .. } => Some(Phase::ToolCall),
            _ => None,
        }
    }

    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}
