//! MCP server records and the line-delimited stdio wire shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerStatus {
    /// Known but not running.
    Registered,
    /// Handshake completed, tools cached.
    Online,
    /// Spawn or handshake failed.
    Error,
}

impl McpServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Online => "online",
            Self::Error => "error",
        }
    }
}

/// A supervised MCP tool server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip)]
    pub env: HashMap<String, String>,
    /// Tool names, refreshed on connect.
    pub capabilities: Vec<String>,
    pub status: McpServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub metadata: Value,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A tool advertised by a connected server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Requests written to a subprocess, one JSON document per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StdioRequest {
    Initialize { version: String },
    ListTools,
    ToolCall { tool: ToolCallSpec },
    Shutdown,
}

impl StdioRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::ListTools => "list_tools",
            Self::ToolCall { .. } => "tool_call",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallSpec {
    pub name: String,
    pub args: Value,
}

/// The wire line: request id alongside the tagged request body.
#[derive(Serialize)]
pub struct RequestLine<'a> {
    pub id: &'a str,
    #[serde(flatten)]
    pub request: &'a StdioRequest,
}

/// A response line from a subprocess.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StdioResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub tools: Option<Vec<McpTool>>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Outcome of a tool call, error payload propagated verbatim.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: Option<Value>,
    pub metadata: Option<Value>,
    pub error: Option<Value>,
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_shapes() {
        let init = StdioRequest::Initialize {
            version: MCP_PROTOCOL_VERSION.to_string(),
        };
        let line = serde_json::to_value(RequestLine {
            id: "r1",
            request: &init,
        })
        .unwrap();
        assert_eq!(line, json!({"id": "r1", "type": "initialize", "version": "1.0"}));

        let call = StdioRequest::ToolCall {
            tool: ToolCallSpec {
                name: "read".into(),
                args: json!({"path": "/a"}),
            },
        };
        let line = serde_json::to_value(RequestLine {
            id: "r2",
            request: &call,
        })
        .unwrap();
        assert_eq!(
            line,
            json!({"id": "r2", "type": "tool_call", "tool": {"name": "read", "args": {"path": "/a"}}})
        );

        let line = serde_json::to_value(RequestLine {
            id: "r3",
            request: &StdioRequest::ListTools,
        })
        .unwrap();
        assert_eq!(line, json!({"id": "r3", "type": "list_tools"}));
    }

    #[test]
    fn test_response_parsing() {
        let resp: StdioResponse =
            serde_json::from_str(r#"{"id":"r1","tools":[{"name":"read"}]}"#).unwrap();
        assert_eq!(resp.id.as_deref(), Some("r1"));
        assert_eq!(resp.tools.unwrap()[0].name, "read");
        assert!(resp.error.is_none());

        let resp: StdioResponse =
            serde_json::from_str(r#"{"id":"r2","error":"tool exploded"}"#).unwrap();
        assert_eq!(resp.error.unwrap(), json!("tool exploded"));
    }
}
