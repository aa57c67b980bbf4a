//! Typed decode of the wire catalogue.
//!
//! A [`crate::frame::Frame`] carries `(type, content)`; [`Message::decode`]
//! turns that pair into a tagged union with typed content. Unknown types
//! surface as `UnsupportedMessageType`, known types with bad content as
//! `InvalidMessage`; the router never sees raw `content` for catalogued
//! operations.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::frame::Frame;

// ============================================================================
// Content shapes
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Ping {
    pub timestamp: Option<String>,
}

/// `agent.register` / `service.register` content. `name` is validated by the
/// router so the error can say which field is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterPeer {
    pub id: Option<String>,
    pub name: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientRegister {
    pub name: Option<String>,
    pub metadata: Value,
}

/// Directory query filter: `status` narrows by lifecycle state,
/// `capabilities` must all be present on a match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerFilter {
    pub status: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusUpdate {
    pub status: Option<String>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientTaskCreate {
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub task_type: Option<String>,
    pub name: Option<String>,
    pub task_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTaskRequest {
    pub target_agent_name: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub task_data: Value,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// Dispatch deadline override, milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTaskExecute {
    pub service_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusReport {
    pub task_id: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultReport {
    pub task_id: String,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorReport {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub error: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskNotification {
    pub task_id: Option<String>,
    pub notification_type: Option<String>,
    pub message: Option<String>,
    pub data: Option<Value>,
    /// Service notifications may carry the agent to forward to.
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: String,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientMessage {
    pub target_agent_id: Option<String>,
    pub target_agent_name: Option<String>,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRef {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolExecute {
    pub server_id: String,
    pub tool_name: String,
    #[serde(default, alias = "args")]
    pub parameters: Value,
}

// ============================================================================
// The catalogue
// ============================================================================

/// Every inbound operation the hub understands, across the three endpoints.
/// Endpoint legality (e.g. `service.register` only on the service port) is
/// the router's call; this type only classifies and types the content.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping(Ping),
    /// A reply to a hub-initiated ping; correlator fodder, no routing.
    Pong,

    AgentRegister(RegisterPeer),
    ServiceRegister(RegisterPeer),
    ClientRegister(ClientRegister),

    AgentListRequest(PeerFilter),
    ServiceListRequest(PeerFilter),
    ClientAgentListRequest(PeerFilter),
    ClientListRequest,
    ServiceToolsList(ServiceRef),

    AgentStatusUpdate(StatusUpdate),
    ServiceStatusUpdate(StatusUpdate),

    ClientTaskCreate(ClientTaskCreate),
    ClientTaskStatusRequest(TaskRef),
    AgentTaskRequest(AgentTaskRequest),
    ServiceTaskExecute(ServiceTaskExecute),

    TaskStatus(TaskStatusReport),
    TaskResult(TaskResultReport),
    TaskError(TaskErrorReport),
    TaskNotification(TaskNotification),
    ServiceTaskResult(TaskResultReport),
    ServiceTaskNotification(TaskNotification),
    ServiceError(TaskErrorReport),

    TaskMessage(TaskMessage),
    TaskMessageResponse(TaskMessage),
    ClientMessage(ClientMessage),

    McpServersList,
    McpToolsList(ServerRef),
    McpToolExecute(McpToolExecute),
}

fn de<T: DeserializeOwned>(kind: &str, content: Value) -> Result<T, HubError> {
    serde_json::from_value(content)
        .map_err(|e| HubError::invalid(format!("{}: {}", kind, e)))
}

impl Message {
    /// Classify and type a frame's `(type, content)` pair.
    pub fn decode(frame: &Frame) -> Result<Self, HubError> {
        Self::decode_parts(&frame.kind, frame.content.clone())
    }

    pub fn decode_parts(kind: &str, content: Value) -> Result<Self, HubError> {
        // Peers may omit `content` entirely; treat that as an empty object.
        let content = if content.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            content
        };
        let msg = match kind {
            "ping" => Self::Ping(de(kind, content)?),
            "pong" => Self::Pong,

            "agent.register" => Self::AgentRegister(de(kind, content)?),
            "service.register" => Self::ServiceRegister(de(kind, content)?),
            "client.register" => Self::ClientRegister(de(kind, content)?),

            "agent.list.request" => Self::AgentListRequest(de(kind, content)?),
            "service.list" => Self::ServiceListRequest(de(kind, content)?),
            "client.agent.list.request" => Self::ClientAgentListRequest(de(kind, content)?),
            "client.list" => Self::ClientListRequest,
            "service.tools.list" => Self::ServiceToolsList(de(kind, content)?),

            // `agent.status` is the legacy spelling of `agent.status.update`.
            "agent.status" | "agent.status.update" => Self::AgentStatusUpdate(de(kind, content)?),
            "service.status.update" => Self::ServiceStatusUpdate(de(kind, content)?),

            // `client.task.create` is the legacy spelling.
            "client.task.create" | "client.agent.task.create.request" => {
                Self::ClientTaskCreate(de(kind, content)?)
            }
            "client.agent.task.status.request" => Self::ClientTaskStatusRequest(de(kind, content)?),
            "agent.task.request" => Self::AgentTaskRequest(de(kind, content)?),
            "service.task.execute" => Self::ServiceTaskExecute(de(kind, content)?),

            "task.status" => Self::TaskStatus(de(kind, content)?),
            "task.result" => Self::TaskResult(de(kind, content)?),
            "task.error" => Self::TaskError(de(kind, content)?),
            "task.notification" => Self::TaskNotification(de(kind, content)?),
            "service.task.result" => Self::ServiceTaskResult(de(kind, content)?),
            "service.task.notification" => Self::ServiceTaskNotification(de(kind, content)?),
            "service.error" => Self::ServiceError(de(kind, content)?),

            "task.message" => Self::TaskMessage(de(kind, content)?),
            "task.messageresponse" => Self::TaskMessageResponse(de(kind, content)?),
            "client.message" => Self::ClientMessage(de(kind, content)?),

            "mcp.servers.list" | "agent.mcp.servers.list" | "client.mcp.server.list.request" => {
                Self::McpServersList
            }
            "mcp.tools.list" | "agent.mcp.tools.list" | "mcp.server.tools" => {
                Self::McpToolsList(de(kind, content)?)
            }
            "mcp.tool.execute" | "agent.mcp.tool.execute" => {
                Self::McpToolExecute(de(kind, content)?)
            }

            other => {
                return Err(HubError::UnsupportedMessageType {
                    kind: other.to_string(),
                })
            }
        };
        Ok(msg)
    }
}
