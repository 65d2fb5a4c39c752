//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::time::Duration;

/// Default deadline for the `initialize` handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default deadline for `tools/list` discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 10_000;

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_discovery_timeout() -> u64 {
    DEFAULT_DISCOVERY_TIMEOUT_MS
}

/// Top-level MCP client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Whether MCP is enabled at all.
    #[serde(default)]
    pub enabled: bool,
    /// Server definitions, looked up by name in order.
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub name: String,
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Deadlines applied by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_ms: u64,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_ms: u64,
    /// Per tool call. `None` waits indefinitely.
    #[serde(default)]
    pub call_ms: Option<u64>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            discovery_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            call_ms: None,
        }
    }
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn call(&self) -> Option<Duration> {
        self.call_ms.map(Duration::from_millis)
    }
}

impl ClientConfig {
    /// Find a server definition by name.
    pub fn server(&self, name: &str) -> Option<&ServerDefinition> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// A fully resolved request to launch a server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParameters {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// The complete environment the child is started with.
    pub env: HashMap<OsString, OsString>,
}

impl ServerParameters {
    /// Resolve a definition against the current process environment.
    pub fn resolve(server: &ServerDefinition) -> Self {
        Self {
            name: server.name.clone(),
            command: server.command.clone(),
            args: server.args.clone(),
            env: effective_env(&server.env),
        }
    }
}

/// The inherited process environment with `overlay` merged on top.
///
/// Inherited variables are passed through as-is, including ones that are not
/// valid UTF-8.
pub fn effective_env(overlay: &HashMap<String, String>) -> HashMap<OsString, OsString> {
    merge_env(std::env::vars_os(), overlay)
}

/// Merge `overlay` over `inherited`; overlay values win on conflicting keys.
pub fn merge_env<I>(inherited: I, overlay: &HashMap<String, String>) -> HashMap<OsString, OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: HashMap<OsString, OsString> = inherited.into_iter().collect();
    env.extend(
        overlay
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    env
}
