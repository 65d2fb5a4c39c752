//! Synchronous MCP (Model Context Protocol) client.
//!
//! Supports stdio-based MCP servers that communicate via newline-delimited
//! JSON-RPC 2.0 messages. A client owns a single-threaded runtime and blocks
//! on it for each call, so it can be used from plain synchronous code: spawn a
//! configured server, handshake, discover its tools, and call them.

pub mod client;
pub mod config;
pub mod error;
pub mod invoker;
pub mod jsonrpc;
pub mod runtime;
pub mod scope;
pub mod session;
pub mod transport;

pub use client::{ClientState, McpClient};
pub use config::{ClientConfig, ServerDefinition, ServerParameters, Timeouts};
pub use error::{McpError, Phase};
pub use invoker::extract_text;
pub use runtime::EventLoopHost;
pub use scope::ResourceStack;
pub use session::{CallToolResult, ClientSession, Content, ToolCatalog, ToolDescriptor};
pub use transport::{Launcher, LaunchedTransport, StdioLauncher, TransportHandle};
