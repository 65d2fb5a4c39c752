//! Synchronous tool invocation on a connected client.

use crate::client::{ClientState, McpClient, with_deadline};
use crate::error::{McpError, Phase};
use crate::session::CallToolResult;
use crate::transport::Launcher;
use std::time::Duration;

/// Text of the first text part, or the whole result rendered as JSON.
pub fn extract_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .find_map(|part| part.as_text())
        .map(str::to_string)
        .unwrap_or_else(|| result.to_string())
}

fn into_arguments(
    tool: &str,
    arguments: serde_json::Value,
) -> Result<serde_json::Map<String, serde_json::Value>, McpError> {
    match arguments {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(serde_json::Map::new()),
        other => Err(McpError::ToolCall {
            tool: tool.to_string(),
            reason: format!("arguments must be a JSON object, got {other}"),
        }),
    }
}

impl<L: Launcher> McpClient<L> {
    /// Call a tool and return its text output.
    ///
    /// Uses the configured call deadline, which by default is none.
    pub fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError> {
        self.call_tool_with_timeout(tool_name, arguments, self.config.timeouts.call())
    }

    /// Call a tool with an explicit deadline (`None` waits indefinitely).
    pub fn call_tool_with_timeout(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<String, McpError> {
        let result = self.call_tool_result(tool_name, arguments, timeout)?;
        if let Some(text) = result.content.first().and_then(|c| c.as_text()) {
            tracing::debug!("Tool '{tool_name}' result: {text}");
        }
        Ok(extract_text(&result))
    }

    /// Call a tool and return the full structured result.
    pub fn call_tool_result(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, McpError> {
        let connection = match (&self.connection, self.state) {
            (Some(connection), ClientState::Ready) => connection,
            _ => return Err(McpError::NotConnected),
        };
        let arguments = into_arguments(tool_name, arguments)?;
        let session = &connection.session;
        let server = connection.server.as_str();

        let result = self.host.run(async {
            let call = session.call_tool(tool_name, arguments);
            let outcome = match timeout {
                Some(limit) => with_deadline(server, Phase::ToolCall, limit, call).await?,
                None => call.await,
            };
            outcome.map_err(|e| McpError::ToolCall {
                tool: tool_name.to_string(),
                reason: e.to_string(),
            })
        })?;

        if result.is_error {
            tracing::warn!("Tool '{tool_name}' on '{server}' reported an error");
        }
        Ok(result)
    }
}
