//! Typed error taxonomy for the hub.
//!
//! Every category maps to a wire `error` frame: `content.code` carries the
//! category name, `content.error` the human-readable message.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::frame::Frame;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "error_kind", rename_all = "snake_case")]
pub enum HubError {
    /// Malformed JSON, missing `type`, or a required content field absent.
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// Registration missing name/id, or an operation from an unregistered
    /// connection.
    #[error("unknown identity: {reason}")]
    UnknownIdentity { reason: String },

    /// Registration arrived for a connection the registry never saw.
    #[error("unknown connection: {connection_id}")]
    UnknownConnection { connection_id: String },

    /// Unknown agent, service, client, task, MCP server, or tool.
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    /// Task status cannot move from `from` to `to`.
    #[error("illegal task transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Target peer is offline, unreachable, or the transport write failed.
    #[error("peer unavailable: {reason}")]
    UnavailablePeer { reason: String },

    /// No reply within the deadline.
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The frame's `type` is not in the catalogue.
    #[error("unsupported message type: {kind}")]
    UnsupportedMessageType { kind: String },

    /// The hub is stopping; all in-flight requests fail with this.
    #[error("hub shutting down")]
    Shutdown,
}

impl HubError {
    /// Category code surfaced on wire `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage { .. } => "InvalidMessage",
            Self::UnknownIdentity { .. } => "UnknownIdentity",
            Self::UnknownConnection { .. } => "UnknownConnection",
            Self::NotFound { .. } => "NotFound",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::UnavailablePeer { .. } => "UnavailablePeer",
            Self::Timeout { .. } => "Timeout",
            Self::UnsupportedMessageType { .. } => "UnsupportedMessageType",
            Self::Shutdown => "Shutdown",
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            reason: reason.into(),
        }
    }

    pub fn unknown_identity(reason: impl Into<String>) -> Self {
        Self::UnknownIdentity {
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::UnavailablePeer {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Build the wire `error` frame for this error, echoing `request_id`
    /// when the failing frame is known.
    pub fn to_frame(&self, request_id: Option<String>, details: Option<Value>) -> Frame {
        let mut content = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        if let Some(details) = details {
            content["details"] = details;
        }
        let mut frame = Frame::new("error", content);
        frame.request_id = request_id;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_match_taxonomy() {
        assert_eq!(HubError::invalid("x").code(), "InvalidMessage");
        assert_eq!(
            HubError::UnsupportedMessageType {
                kind: "bogus".into()
            }
            .code(),
            "UnsupportedMessageType"
        );
        assert_eq!(HubError::Shutdown.code(), "Shutdown");
    }

    #[test]
    fn test_error_frame_echoes_request_id() {
        let err = HubError::not_found("agent", "A1");
        let frame = err.to_frame(Some("req-1".into()), None);
        assert_eq!(frame.kind, "error");
        assert_eq!(frame.request_id.as_deref(), Some("req-1"));
        assert_eq!(frame.content["code"], "NotFound");
        assert!(frame.content["error"].as_str().unwrap().contains("A1"));
    }

    #[test]
    fn test_serde_tagged_roundtrip() {
        let err = HubError::IllegalTransition {
            from: "completed".into(),
            to: "pending".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("illegal_transition"));
        let back: HubError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
