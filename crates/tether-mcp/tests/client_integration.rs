//! Lifecycle tests for `McpClient` against an in-process mock server.
//!
//! The mock launcher records every launch and every transport teardown, so
//! tests can check that failed or replaced connections release what they
//! acquired, and in which order.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tether_mcp::jsonrpc::{JsonRpcResponse, OutgoingMessage};
use tether_mcp::transport::{BoxFuture, CHANNEL_CAPACITY};
use tether_mcp::{
    ClientConfig, ClientState, LaunchedTransport, Launcher, McpClient, McpError, Phase,
    ServerDefinition, ServerParameters, Timeouts, TransportHandle,
};
use tokio::sync::mpsc::{self, WeakSender};

// ---------------------------------------------------------------------------
// MockLauncher
// ---------------------------------------------------------------------------

/// How the mock server answers.
#[derive(Clone)]
struct Behavior {
    handshake_delay: Duration,
    discovery_delay: Duration,
    call_delay: Duration,
    handshake_error: bool,
    tools: Value,
    call_result: Value,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::ZERO,
            discovery_delay: Duration::ZERO,
            call_delay: Duration::ZERO,
            handshake_error: false,
            tools: json!([{"name": "echo", "inputSchema": {"type": "object"}}]),
            call_result: json!({"content": [{"type": "text", "text": "hello"}]}),
        }
    }
}

/// Observations shared between the test and the mock.
#[derive(Clone, Default)]
struct Recorder {
    launches: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    last_params: Arc<Mutex<Option<ServerParameters>>>,
    /// Per transport close: whether the session still held its writer.
    session_open_at_close: Arc<Mutex<Vec<bool>>>,
}

impl Recorder {
    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn session_open_at_close(&self) -> Vec<bool> {
        self.session_open_at_close.lock().unwrap().clone()
    }
}

struct MockLauncher {
    behavior: Behavior,
    recorder: Recorder,
    fail_launch: bool,
}

struct MockHandle {
    recorder: Recorder,
    writer: WeakSender<OutgoingMessage>,
}

impl TransportHandle for MockHandle {
    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            // Only the session holds a strong writer; it is gone once the
            // session has been released
            let session_open = self.writer.upgrade().is_some();
            self.recorder
                .session_open_at_close
                .lock()
                .unwrap()
                .push(session_open);
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}

impl Launcher for MockLauncher {
    fn launch<'a>(
        &'a self,
        params: &'a ServerParameters,
    ) -> BoxFuture<'a, Result<LaunchedTransport, McpError>> {
        Box::pin(async move {
            self.recorder.launches.fetch_add(1, Ordering::SeqCst);
            *self.recorder.last_params.lock().unwrap() = Some(params.clone());
            if self.fail_launch {
                return Err(McpError::SpawnFailed {
                    name: params.name.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock"),
                });
            }

            let (to_client, read) = mpsc::channel::<JsonRpcResponse>(CHANNEL_CAPACITY);
            let (write, mut from_client) = mpsc::channel::<OutgoingMessage>(CHANNEL_CAPACITY);
            let behavior = self.behavior.clone();
            let writer = write.downgrade();
            tokio::spawn(async move {
                while let Some(msg) = from_client.recv().await {
                    let OutgoingMessage::Request(req) = msg else {
                        continue;
                    };
                    let behavior = behavior.clone();
                    let to_client = to_client.clone();
                    tokio::spawn(async move {
                        let resp = answer(&behavior, req.id, &req.method, req.params).await;
                        let _ = to_client.send(resp).await;
                    });
                }
            });

            Ok(LaunchedTransport {
                handle: Box::new(MockHandle {
                    recorder: self.recorder.clone(),
                    writer,
                }),
                read,
                write,
            })
        })
    }
}

async fn answer(
    behavior: &Behavior,
    id: u64,
    method: &str,
    params: Option<Value>,
) -> JsonRpcResponse {
    match method {
        "initialize" => {
            tokio::time::sleep(behavior.handshake_delay).await;
            if behavior.handshake_error {
                return JsonRpcResponse::failure(id, -32602, "unsupported protocol version");
            }
            JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "mock", "version": "0.0.1"},
                    "capabilities": {"tools": {}}
                }),
            )
        }
        "tools/list" => {
            tokio::time::sleep(behavior.discovery_delay).await;
            JsonRpcResponse::success(id, json!({ "tools": behavior.tools }))
        }
        "tools/call" => {
            let params = params.unwrap_or_default();
            if params["name"] == "missing" {
                return JsonRpcResponse::failure(id, -32602, "Unknown tool: missing");
            }
            if params["name"] == "slow" {
                tokio::time::sleep(behavior.call_delay).await;
            }
            JsonRpcResponse::success(id, behavior.call_result.clone())
        }
        other => JsonRpcResponse::failure(id, -32601, format!("Method not found: {other}")),
    }
}

fn server(name: &str) -> ServerDefinition {
    ServerDefinition {
        name: name.to_string(),
        command: "mock-server".to_string(),
        args: vec!["--stdio".to_string()],
        env: HashMap::new(),
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        enabled: true,
        servers: vec![server("mock"), server("other")],
        timeouts: Timeouts {
            handshake_ms: 200,
            discovery_ms: 200,
            call_ms: None,
        },
    }
}

fn client_with(config: ClientConfig, behavior: Behavior) -> (McpClient<MockLauncher>, Recorder) {
    let recorder = Recorder::default();
    let launcher = MockLauncher {
        behavior,
        recorder: recorder.clone(),
        fail_launch: false,
    };
    (McpClient::with_launcher(config, launcher).unwrap(), recorder)
}

fn client(behavior: Behavior) -> (McpClient<MockLauncher>, Recorder) {
    client_with(config(), behavior)
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

#[test]
fn unknown_server_fails_without_launching() {
    let (mut client, recorder) = client(Behavior::default());
    for name in ["nope", "", "MOCK"] {
        match client.connect(name) {
            Err(McpError::ServerNotFound { name: missing }) => assert_eq!(missing, name),
            other => panic!("Expected ServerNotFound, got: {other:?}"),
        }
    }
    assert_eq!(recorder.launches(), 0);
}

#[test]
fn disabled_config_fails_for_any_name() {
    let mut cfg = config();
    cfg.enabled = false;
    let (mut client, recorder) = client_with(cfg, Behavior::default());
    assert!(matches!(client.connect("mock"), Err(McpError::NotEnabled)));
    assert!(matches!(client.connect("nope"), Err(McpError::NotEnabled)));
    assert_eq!(recorder.launches(), 0);
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[test]
fn launch_failure_releases_nothing_and_fails() {
    let recorder = Recorder::default();
    let launcher = MockLauncher {
        behavior: Behavior::default(),
        recorder: recorder.clone(),
        fail_launch: true,
    };
    let mut client = McpClient::with_launcher(config(), launcher).unwrap();
    let err = client.connect("mock").unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Launch));
    assert_eq!(recorder.launches(), 1);
    assert_eq!(recorder.closes(), 0);
    assert_eq!(client.state(), ClientState::Failed);
}

// ---------------------------------------------------------------------------
// Setup deadlines and teardown
// ---------------------------------------------------------------------------

#[test]
fn slow_handshake_times_out_and_releases_transport() {
    let (mut client, recorder) = client(Behavior {
        handshake_delay: Duration::from_secs(5),
        ..Behavior::default()
    });

    match client.connect("mock") {
        Err(McpError::Timeout { phase, timeout_ms, .. }) => {
            assert_eq!(phase, Phase::Handshake);
            assert_eq!(timeout_ms, 200);
        }
        other => panic!("Expected handshake timeout, got: {other:?}"),
    }
    assert_eq!(recorder.closes(), 1);
    assert_eq!(client.state(), ClientState::Failed);
    assert!(client.session().is_none());
    assert!(client.tools().is_none());
}

#[test]
fn slow_discovery_times_out_and_releases_transport() {
    let (mut client, recorder) = client(Behavior {
        discovery_delay: Duration::from_secs(5),
        ..Behavior::default()
    });

    let err = client.connect("mock").unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.phase(), Some(Phase::Discovery));
    assert_eq!(recorder.closes(), 1);
    assert_eq!(client.state(), ClientState::Failed);
    assert!(client.session().is_none());
}

#[test]
fn rejected_handshake_is_a_handshake_error() {
    let (mut client, recorder) = client(Behavior {
        handshake_error: true,
        ..Behavior::default()
    });

    match client.connect("mock") {
        Err(McpError::Handshake { server, reason }) => {
            assert_eq!(server, "mock");
            assert!(reason.contains("unsupported protocol version"));
        }
        other => panic!("Expected Handshake error, got: {other:?}"),
    }
    assert_eq!(recorder.closes(), 1);
}

#[test]
fn empty_catalog_is_a_discovery_error() {
    let (mut client, recorder) = client(Behavior {
        tools: json!([]),
        ..Behavior::default()
    });

    let err = client.connect("mock").unwrap_err();
    assert!(matches!(err, McpError::Discovery { .. }));
    assert_eq!(recorder.closes(), 1);
    assert!(client.tools().is_none());
}

#[test]
fn calls_after_failed_connect_are_not_connected() {
    let (mut client, _recorder) = client(Behavior {
        handshake_delay: Duration::from_secs(5),
        ..Behavior::default()
    });
    client.connect("mock").unwrap_err();
    let err = client.call_tool("echo", json!({})).unwrap_err();
    assert!(matches!(err, McpError::NotConnected));
}

// ---------------------------------------------------------------------------
// Successful connections
// ---------------------------------------------------------------------------

#[test]
fn connect_publishes_catalog_and_session() {
    let (mut client, recorder) = client(Behavior::default());
    let (tools, session) = client.connect("mock").unwrap();

    assert_eq!(client.state(), ClientState::Ready);
    assert!(client.is_connected());
    assert_eq!(tools.names().collect::<Vec<_>>(), ["echo"]);
    assert_eq!(client.tools(), Some(&tools));
    assert_eq!(client.server_name(), Some("mock"));
    assert_eq!(session.server_name(), "mock");
    assert_eq!(session.server_info().unwrap().server_info.name, "mock");
    assert_eq!(recorder.launches(), 1);
    assert_eq!(recorder.closes(), 0);
}

#[test]
fn launch_receives_resolved_parameters() {
    let mut cfg = config();
    cfg.servers[0].env = HashMap::from([
        ("PATH".to_string(), "/overlay/bin".to_string()),
        ("B".to_string(), "3".to_string()),
    ]);
    let (mut client, recorder) = client_with(cfg, Behavior::default());
    client.connect("mock").unwrap();

    let params = recorder.last_params.lock().unwrap().clone().unwrap();
    assert_eq!(params.command, "mock-server");
    assert_eq!(params.args, ["--stdio"]);
    assert_eq!(params.env[OsStr::new("PATH")], "/overlay/bin");
    assert_eq!(params.env[OsStr::new("B")], "3");
    let inherited = std::env::vars_os()
        .filter(|(k, _)| k != "PATH" && k != "B")
        .count();
    assert_eq!(params.env.len(), inherited + 2);
}

#[test]
fn text_result_is_returned_verbatim() {
    let (mut client, _recorder) = client(Behavior::default());
    client.connect("mock").unwrap();
    let text = client.call_tool("echo", json!({"message": "hi"})).unwrap();
    assert_eq!(text, "hello");
}

#[test]
fn non_text_result_falls_back_to_rendering() {
    let (mut client, _recorder) = client(Behavior {
        call_result: json!({
            "content": [{"type": "image", "data": "iVBORw0KGgo=", "mimeType": "image/png"}],
            "isError": false
        }),
        ..Behavior::default()
    });
    client.connect("mock").unwrap();

    let text = client.call_tool("echo", Value::Null).unwrap();
    assert!(!text.is_empty());
    assert!(text.contains("image/png"));

    let structured = client.call_tool_result("echo", Value::Null, None).unwrap();
    assert!(structured.content[0].as_text().is_none());
}

#[test]
fn remote_error_is_a_tool_call_error() {
    let (mut client, _recorder) = client(Behavior::default());
    client.connect("mock").unwrap();

    match client.call_tool("missing", json!({})) {
        Err(McpError::ToolCall { tool, reason }) => {
            assert_eq!(tool, "missing");
            assert!(reason.contains("Unknown tool"));
        }
        other => panic!("Expected ToolCall error, got: {other:?}"),
    }
    // The session survives a failed call
    assert_eq!(client.call_tool("echo", json!({})).unwrap(), "hello");
}

#[test]
fn call_deadline_times_out_and_session_stays_usable() {
    let (mut client, _recorder) = client(Behavior {
        call_delay: Duration::from_secs(5),
        ..Behavior::default()
    });
    client.connect("mock").unwrap();

    let err = client
        .call_tool_with_timeout("slow", json!({}), Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.phase(), Some(Phase::ToolCall));

    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.call_tool("echo", json!({})).unwrap(), "hello");
}

#[test]
fn configured_call_deadline_applies_by_default() {
    let mut cfg = config();
    cfg.timeouts.call_ms = Some(50);
    let (mut client, _recorder) = client_with(
        cfg,
        Behavior {
            call_delay: Duration::from_secs(5),
            ..Behavior::default()
        },
    );
    client.connect("mock").unwrap();
    let err = client.call_tool("slow", json!({})).unwrap_err();
    assert!(matches!(err, McpError::Timeout { phase: Phase::ToolCall, timeout_ms: 50, .. }));
}

// ---------------------------------------------------------------------------
// Teardown paths
// ---------------------------------------------------------------------------

#[test]
fn reconnect_tears_down_previous_connection() {
    let (mut client, recorder) = client(Behavior::default());
    let (_, first) = client.connect("mock").unwrap();
    let (_, second) = client.connect("other").unwrap();

    assert_eq!(recorder.launches(), 2);
    assert_eq!(recorder.closes(), 1);
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(client.server_name(), Some("other"));
}

#[test]
fn bad_reconnect_keeps_existing_connection() {
    let (mut client, recorder) = client(Behavior::default());
    client.connect("mock").unwrap();
    assert!(client.connect("nope").is_err());

    assert_eq!(recorder.closes(), 0);
    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.call_tool("echo", json!({})).unwrap(), "hello");
}

#[test]
fn disconnect_releases_and_blocks_calls() {
    let (mut client, recorder) = client(Behavior::default());
    let (_, session) = client.connect("mock").unwrap();

    client.disconnect().unwrap();
    assert_eq!(recorder.closes(), 1);
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(session.is_closed());
    assert!(matches!(
        client.call_tool("echo", json!({})),
        Err(McpError::NotConnected)
    ));

    // A second disconnect has nothing left to release
    client.disconnect().unwrap();
    assert_eq!(recorder.closes(), 1);
}

#[test]
fn dropping_client_releases_connection() {
    let (mut client, recorder) = client(Behavior::default());
    client.connect("mock").unwrap();
    drop(client);
    assert_eq!(recorder.closes(), 1);
}

#[test]
fn session_is_released_before_transport() {
    // Successful connect, then disconnect
    let (mut client, recorder) = client(Behavior::default());
    client.connect("mock").unwrap();
    client.disconnect().unwrap();
    assert_eq!(recorder.session_open_at_close(), [false]);

    // Handshake deadline
    let (mut client, recorder) = crate::client(Behavior {
        handshake_delay: Duration::from_secs(5),
        ..Behavior::default()
    });
    client.connect("mock").unwrap_err();
    assert_eq!(recorder.session_open_at_close(), [false]);

    // Discovery rejected: empty catalog
    let (mut client, recorder) = crate::client(Behavior {
        tools: json!([]),
        ..Behavior::default()
    });
    client.connect("mock").unwrap_err();
    assert_eq!(recorder.session_open_at_close(), [false]);

    // Drop of a live client
    let (mut client, recorder) = crate::client(Behavior::default());
    client.connect("mock").unwrap();
    drop(client);
    assert_eq!(recorder.session_open_at_close(), [false]);
}

#[test]
fn failed_disconnect_leaves_client_consistent() {
    let (mut client, recorder) = client(Behavior::default());
    client.connect("mock").unwrap();

    // Blocking from inside another runtime is refused
    let outer = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let err = outer.block_on(async { client.disconnect() }).unwrap_err();
    assert!(matches!(err, McpError::Reentrant));

    assert!(!client.is_connected());
    assert_eq!(client.state(), ClientState::Failed);
    assert!(matches!(
        client.call_tool("echo", json!({})),
        Err(McpError::NotConnected)
    ));
    // The unreleased resources were dropped, not closed
    assert_eq!(recorder.closes(), 0);
}
