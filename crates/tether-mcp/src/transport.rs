//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and manages async communication over stdin/stdout
//! using newline-delimited JSON-RPC messages. The child's stderr is drained
//! in the background and logged.

use crate::config::ServerParameters;
use crate::error::McpError;
use crate::jsonrpc::{JsonRpcResponse, OutgoingMessage};
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Boxed future used at the collaborator seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Messages arriving from the server.
pub type ReadChannel = mpsc::Receiver<JsonRpcResponse>;

/// Messages headed to the server.
pub type WriteChannel = mpsc::Sender<OutgoingMessage>;

/// Buffer size of the message channels.
pub const CHANNEL_CAPACITY: usize = 64;

/// How long a server gets to exit after stdin closes before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Starts server processes and hands back their message channels.
pub trait Launcher: Send + Sync {
    fn launch<'a>(
        &'a self,
        params: &'a ServerParameters,
    ) -> BoxFuture<'a, Result<LaunchedTransport, McpError>>;
}

/// Owns whatever keeps a transport alive; released exactly once.
pub trait TransportHandle: Send {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// A freshly launched transport.
pub struct LaunchedTransport {
    pub handle: Box<dyn TransportHandle>,
    pub read: ReadChannel,
    pub write: WriteChannel,
}

/// Launches servers as child processes speaking JSON-RPC over stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioLauncher;

impl Launcher for StdioLauncher {
    fn launch<'a>(
        &'a self,
        params: &'a ServerParameters,
    ) -> BoxFuture<'a, Result<LaunchedTransport, McpError>> {
        Box::pin(async move {
            let (transport, read, write) = StdioTransport::spawn(params)?;
            Ok(LaunchedTransport {
                handle: Box::new(transport),
                read,
                write,
            })
        })
    }
}

/// A running server process and its I/O tasks.
pub struct StdioTransport {
    name: String,
    child: Child,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
    stderr_handle: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn a child process and start background reader/writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        params: &ServerParameters,
    ) -> Result<(Self, ReadChannel, WriteChannel), McpError> {
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .env_clear()
            .envs(&params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: params.name.clone(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("failed to capture server stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("failed to capture server stdout".to_string()))?;
        let stderr_handle = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(params.name.clone(), stderr)));

        // Writer task: drains channel and writes to child stdin
        let (write_tx, mut write_rx) = mpsc::channel::<OutgoingMessage>(CHANNEL_CAPACITY);
        let writer_name = params.name.clone();
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = write_rx.recv().await {
                let line = match serde_json::to_string(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to serialize '{}' for {writer_name}: {e}",
                            msg.method().unwrap_or("response")
                        );
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: reads lines from stdout and forwards parsed messages
        let (read_tx, read_rx) = mpsc::channel::<JsonRpcResponse>(CHANNEL_CAPACITY);
        let reader_name = params.name.clone();
        let reader_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let msg: JsonRpcResponse = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to parse MCP message from {reader_name}: {e}: {line}"
                        );
                        continue;
                    }
                };
                if read_tx.send(msg).await.is_err() {
                    break;
                }
            }
            tracing::debug!("MCP server '{reader_name}' closed stdout");
        });

        tracing::debug!(
            "Spawned MCP server '{}': {} {:?}",
            params.name,
            params.command,
            params.args
        );

        let transport = Self {
            name: params.name.clone(),
            child,
            reader_handle,
            writer_handle,
            stderr_handle,
        };
        Ok((transport, read_rx, write_tx))
    }

    /// OS process id of the server, if it is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Shut down the transport: close stdin, wait briefly, then kill.
    pub async fn shutdown(mut self) {
        // The writer owns stdin; stopping it sends EOF to the child
        self.writer_handle.abort();

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("MCP server '{}' exited with {status}", self.name);
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for MCP server '{}': {e}", self.name);
            }
            Err(_) => {
                tracing::debug!("MCP server '{}' did not exit, killing", self.name);
                if let Err(e) = self.child.kill().await {
                    tracing::warn!("Failed to kill MCP server '{}': {e}", self.name);
                }
            }
        }

        self.reader_handle.abort();
        if let Some(handle) = self.stderr_handle.take() {
            handle.abort();
        }
    }
}

impl TransportHandle for StdioTransport {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin((*self).shutdown())
    }
}

/// Log the server's stderr line by line until it closes.
///
/// Failures here stop the drain and are never surfaced to the caller.
async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!("Server stderr [{server}]: {}", line.trim_end()),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stderr reader for '{server}' stopped: {e}");
                break;
            }
        }
    }
}
