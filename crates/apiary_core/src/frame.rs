//! The wire envelope exchanged with every peer.
//!
//! One JSON document per WebSocket text frame:
//! `{"id", "type", "content", "requestId"?, "timestamp"}`.
//! Replies carry the original frame's `id` in `requestId`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Version string advertised in welcome frames.
pub const HUB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default deadline for send-and-await round trips.
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

fn mint_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// A single protocol frame. `content` stays schemaless at the edge; typed
/// decoding happens in [`crate::message::Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique per frame within one hub run. Minted if the peer omits it.
    #[serde(default = "mint_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    /// Id of the frame being answered, if this is a reply.
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default = "now_rfc3339")]
    pub timestamp: String,
}

impl Frame {
    /// Build a fresh outbound frame with a new id and current timestamp.
    pub fn new(kind: impl Into<String>, content: impl Serialize) -> Self {
        Self {
            id: mint_id(),
            kind: kind.into(),
            content: serde_json::to_value(content).unwrap_or(Value::Null),
            request_id: None,
            timestamp: now_rfc3339(),
        }
    }

    /// Build a reply to `request`: fresh id, `requestId` set to the original's id.
    pub fn reply(request: &Frame, kind: impl Into<String>, content: impl Serialize) -> Self {
        let mut frame = Self::new(kind, content);
        frame.request_id = Some(request.id.clone());
        frame
    }

    /// Attach a request id after construction.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Parse a frame from raw text. Missing `id`/`timestamp` are assigned.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for the wire.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Frame serialization failed: {}", e);
            format!(
                r#"{{"id":"{}","type":"error","content":{{"error":"serialization failed"}},"timestamp":"{}"}}"#,
                mint_id(),
                now_rfc3339()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_links_request_id() {
        let req = Frame::new("ping", json!({}));
        let resp = Frame::reply(&req, "pong", json!({"timestamp": "now"}));
        assert_eq!(resp.request_id.as_deref(), Some(req.id.as_str()));
        assert_ne!(resp.id, req.id);
    }

    #[test]
    fn test_parse_assigns_missing_id_and_timestamp() {
        let frame = Frame::parse(r#"{"type":"ping","content":{}}"#).unwrap();
        assert!(!frame.id.is_empty());
        assert!(!frame.timestamp.is_empty());
        assert_eq!(frame.kind, "ping");
    }

    #[test]
    fn test_wire_shape_uses_camel_case_request_id() {
        let req = Frame::new("agent.register", json!({"name": "A1"}));
        let resp = Frame::reply(&req, "agent.registered", json!({}));
        let text = resp.to_text();
        assert!(text.contains("\"requestId\""));
        assert!(text.contains("\"type\":\"agent.registered\""));

        let back = Frame::parse(&text).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn test_request_id_omitted_when_absent() {
        let frame = Frame::new("ping", json!({}));
        assert!(!frame.to_text().contains("requestId"));
    }
}
