//! MCP-on-behalf-of: peers reach supervised tool servers through the hub.
//!
//! Reply naming follows the request's spelling: agent-side requests get
//! `<request type>.result`; the client endpoint keeps its own reply types.

use serde_json::json;

use apiary_core::message::{McpToolExecute, ServerRef};
use apiary_core::{Frame, HubError, PeerKind};

use crate::router::Router;

fn reply_kind(kind: PeerKind, frame_kind: &str, client_reply: &str) -> String {
    match kind {
        PeerKind::Client => client_reply.to_string(),
        _ => format!("{}.result", frame_kind),
    }
}

impl Router {
    pub(crate) async fn handle_mcp_servers_list(
        &self,
        kind: PeerKind,
        connection_id: &str,
        frame: &Frame,
    ) -> Result<(), HubError> {
        let servers = self.mcp.list_servers().await;
        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                reply_kind(kind, &frame.kind, "mcp.server.list"),
                json!({"status": "success", "servers": servers}),
            ),
        )
    }

    pub(crate) async fn handle_mcp_tools_list(
        &self,
        kind: PeerKind,
        connection_id: &str,
        frame: &Frame,
        server: ServerRef,
    ) -> Result<(), HubError> {
        let record = self
            .mcp
            .resolve(&server.server_id)
            .await
            .ok_or_else(|| HubError::not_found("MCP server", server.server_id.as_str()))?;
        let tools = self.mcp.list_tools(&record.id).await?;
        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                reply_kind(kind, &frame.kind, "mcp.server.tools"),
                json!({
                    "status": "success",
                    "serverId": record.id,
                    "serverName": record.name,
                    "tools": tools,
                }),
            ),
        )
    }

    /// Tool execution. Failures (supervisor errors and tool-reported
    /// errors alike) come back on the result reply with `status: error`,
    /// not as a bare error frame.
    pub(crate) async fn handle_mcp_tool_execute(
        &self,
        kind: PeerKind,
        connection_id: &str,
        frame: &Frame,
        execute: McpToolExecute,
    ) -> Result<(), HubError> {
        let reply = reply_kind(kind, &frame.kind, "mcp.tool.execution.result");
        let record = self
            .mcp
            .resolve(&execute.server_id)
            .await
            .ok_or_else(|| HubError::not_found("MCP server", execute.server_id.as_str()))?;

        let content = match self
            .mcp
            .execute_tool(&record.id, &execute.tool_name, execute.parameters, None)
            .await
        {
            Ok(outcome) if !outcome.is_error() => json!({
                "status": "success",
                "serverId": record.id,
                "toolName": execute.tool_name,
                "result": outcome.result,
                "metadata": outcome.metadata,
            }),
            Ok(outcome) => json!({
                "status": "error",
                "serverId": record.id,
                "toolName": execute.tool_name,
                "error": outcome.error,
            }),
            Err(e) => json!({
                "status": "error",
                "serverId": record.id,
                "toolName": execute.tool_name,
                "error": e.to_string(),
                "code": e.code(),
            }),
        };
        self.connections
            .send(connection_id, Frame::reply(frame, reply, content))
    }
}
