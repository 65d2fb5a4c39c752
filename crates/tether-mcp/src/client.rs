//! MCP client: a synchronous handle on one server connection.
//!
//! All async work runs on the client's own [`EventLoopHost`]. Connection
//! resources are held in a [`ResourceStack`] and released in reverse order on
//! failure, on `disconnect`, on reconnect, and on drop.

use crate::config::{ClientConfig, ServerParameters};
use crate::error::{McpError, Phase};
use crate::runtime::EventLoopHost;
use crate::scope::ResourceStack;
use crate::session::{ClientSession, ToolCatalog};
use crate::transport::{Launcher, StdioLauncher};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Initializing,
    Discovering,
    Ready,
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Initializing => "initializing",
            ClientState::Discovering => "discovering",
            ClientState::Ready => "ready",
            ClientState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A live connection: everything that must be torn down together.
pub(crate) struct Connection {
    pub(crate) server: String,
    pub(crate) stack: ResourceStack,
    pub(crate) session: Arc<ClientSession>,
    pub(crate) tools: ToolCatalog,
}

/// Synchronous client for a single MCP server at a time.
///
/// Owns its event loop, so it must be used outside any async context. If it
/// is dropped inside one, the server process is killed instead of being shut
/// down gracefully.
pub struct McpClient<L: Launcher = StdioLauncher> {
    pub(crate) host: EventLoopHost,
    pub(crate) config: ClientConfig,
    launcher: L,
    pub(crate) state: ClientState,
    pub(crate) connection: Option<Connection>,
}

impl McpClient<StdioLauncher> {
    /// Create a client that launches servers as child processes.
    pub fn new(config: ClientConfig) -> Result<Self, McpError> {
        Self::with_launcher(config, StdioLauncher)
    }
}

impl<L: Launcher> McpClient<L> {
    /// Create a client with a custom launcher.
    pub fn with_launcher(config: ClientConfig, launcher: L) -> Result<Self, McpError> {
        Ok(Self {
            host: EventLoopHost::new()?,
            config,
            launcher,
            state: ClientState::Disconnected,
            connection: None,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Ready && self.connection.is_some()
    }

    /// Tools discovered on the current connection.
    pub fn tools(&self) -> Option<&ToolCatalog> {
        self.connection.as_ref().map(|c| &c.tools)
    }

    /// Handle to the current session.
    pub fn session(&self) -> Option<Arc<ClientSession>> {
        self.connection.as_ref().map(|c| Arc::clone(&c.session))
    }

    /// Name of the server currently connected.
    pub fn server_name(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.server.as_str())
    }

    /// Connect to an MCP server by name.
    ///
    /// An existing connection is torn down first. Configuration problems are
    /// reported before anything is launched or torn down.
    pub fn connect(
        &mut self,
        server_name: &str,
    ) -> Result<(ToolCatalog, Arc<ClientSession>), McpError> {
        if !self.config.enabled {
            return Err(McpError::NotEnabled);
        }
        let server = self
            .config
            .server(server_name)
            .ok_or_else(|| McpError::ServerNotFound {
                name: server_name.to_string(),
            })?;
        let params = ServerParameters::resolve(server);
        let timeouts = self.config.timeouts;

        if self.connection.is_some() {
            tracing::debug!("Replacing MCP connection before connecting to '{server_name}'");
            self.disconnect()?;
        }

        let Self {
            host,
            launcher,
            state,
            ..
        } = self;
        transition(state, ClientState::Connecting);

        let outcome = host.run(async {
            let mut stack = ResourceStack::new();
            let result = establish(
                &mut stack,
                launcher,
                &params,
                state,
                timeouts.handshake(),
                timeouts.discovery(),
            )
            .await;
            match result {
                Ok((session, tools)) => Ok(Connection {
                    server: params.name.clone(),
                    stack,
                    session,
                    tools,
                }),
                Err(e) => {
                    stack.close().await;
                    Err(e)
                }
            }
        });

        match outcome {
            Ok(connection) => {
                transition(&mut self.state, ClientState::Ready);
                tracing::info!(
                    "MCP server '{}' connected with {} tools",
                    connection.server,
                    connection.tools.len()
                );
                let result = (connection.tools.clone(), Arc::clone(&connection.session));
                self.connection = Some(connection);
                Ok(result)
            }
            Err(e) => {
                transition(&mut self.state, ClientState::Failed);
                tracing::warn!("Failed to connect to MCP server '{server_name}': {e}");
                Err(e)
            }
        }
    }

    /// Tear down the current connection, if any.
    pub fn disconnect(&mut self) -> Result<(), McpError> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        let Connection { server, stack, .. } = connection;
        let closed = self.host.run(async move {
            stack.close().await;
            Ok(())
        });
        if let Err(e) = closed {
            // The connection is gone either way; its resources were dropped
            transition(&mut self.state, ClientState::Failed);
            return Err(e);
        }
        transition(&mut self.state, ClientState::Disconnected);
        tracing::debug!("Disconnected from MCP server '{server}'");
        Ok(())
    }
}

impl<L: Launcher> Drop for McpClient<L> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            let Connection { server, stack, .. } = connection;
            // From inside an async context the stack is dropped instead and
            // child processes are killed on drop.
            if let Err(e) = self.host.run(async move {
                stack.close().await;
                Ok(())
            }) {
                tracing::warn!("Could not tear down MCP connection to '{server}' cleanly: {e}");
            }
        }
    }
}

impl<L: Launcher> fmt::Debug for McpClient<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClient")
            .field("state", &self.state)
            .field("server", &self.server_name())
            .finish_non_exhaustive()
    }
}

fn transition(state: &mut ClientState, next: ClientState) {
    tracing::debug!("MCP client state: {state} -> {next}");
    *state = next;
}

/// Launch, handshake and discover, registering every acquisition on `stack`.
async fn establish<L: Launcher>(
    stack: &mut ResourceStack,
    launcher: &L,
    params: &ServerParameters,
    state: &mut ClientState,
    handshake_timeout: Duration,
    discovery_timeout: Duration,
) -> Result<(Arc<ClientSession>, ToolCatalog), McpError> {
    let server = params.name.as_str();

    let launched = launcher.launch(params).await?;
    let handle = launched.handle;
    stack.push("transport", move || handle.close());
    transition(state, ClientState::Initializing);

    let session = ClientSession::new(server, launched.read, launched.write);
    let closing = Arc::clone(&session);
    stack.push("session", move || async move { closing.close().await });

    with_deadline(server, Phase::Handshake, handshake_timeout, session.initialize())
        .await?
        .map_err(|e| McpError::Handshake {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
    transition(state, ClientState::Discovering);

    let tools = with_deadline(server, Phase::Discovery, discovery_timeout, session.list_tools())
        .await?
        .map_err(|e| McpError::Discovery {
            server: server.to_string(),
            reason: e.to_string(),
        })?;
    if tools.is_empty() {
        return Err(McpError::Discovery {
            server: server.to_string(),
            reason: "server returned no tools".to_string(),
        });
    }

    Ok((session, ToolCatalog::new(tools)))
}

/// Await `fut`, failing with a phase-tagged timeout once `limit` passes.
pub(crate) async fn with_deadline<F: Future>(
    server: &str,
    phase: Phase,
    limit: Duration,
    fut: F,
) -> Result<F::Output, McpError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| McpError::Timeout {
            server: server.to_string(),
            phase,
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })
}
