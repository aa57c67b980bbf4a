//! Agent task registry: forward-only status lifecycle with an append-only
//! update journal.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use apiary_core::{HubBus, HubError, HubEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a forward transition. A repeat of the current non-terminal
/// status is a legal no-op (the dispatch-side and agent-side `in_progress`
/// markers may race); backward moves and repeat-terminal are rejected.
pub(crate) fn check_transition(from: TaskStatus, to: TaskStatus) -> Result<(), HubError> {
    let legal = to.rank() > from.rank() || (to == from && !to.is_terminal());
    if legal {
        Ok(())
    } else {
        Err(HubError::IllegalTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// One entry in a task's ordered update journal. The journal keeps growing
/// after a terminal status (late notifications); `status` does not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdateEntry {
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Detail payload merged on a status update.
#[derive(Debug, Clone, Default)]
pub struct UpdateDetails {
    pub message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requesting_agent_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub task_data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub updates: Vec<TaskUpdateEntry>,
}

/// Creation parameters; everything else is filled in by the registry.
#[derive(Debug, Clone, Default)]
pub struct NewAgentTask {
    pub task_type: Option<String>,
    pub name: Option<String>,
    pub agent_id: String,
    pub client_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub requesting_agent_id: Option<String>,
    pub task_data: Value,
}

pub struct TaskRegistry {
    bus: HubBus,
    tasks: RwLock<HashMap<String, AgentTask>>,
}

impl TaskRegistry {
    pub fn new(bus: HubBus) -> Self {
        Self {
            bus,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, new: NewAgentTask) -> Result<AgentTask, HubError> {
        if new.agent_id.is_empty() {
            return Err(HubError::invalid("task requires an agentId"));
        }
        let now = Utc::now();
        let task = AgentTask {
            id: Uuid::new_v4().to_string(),
            task_type: new.task_type,
            name: new.name,
            agent_id: new.agent_id,
            client_id: new.client_id,
            parent_task_id: new.parent_task_id,
            requesting_agent_id: new.requesting_agent_id,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            task_data: new.task_data,
            result: None,
            error: None,
            metadata: None,
            updates: vec![TaskUpdateEntry {
                status: TaskStatus::Pending,
                timestamp: now,
                message: Some("Task created".to_string()),
                data: None,
            }],
        };
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        self.bus.publish(HubEvent::TaskCreated {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
        });
        Ok(task)
    }

    /// Move a task forward, merging detail payloads and journaling the
    /// update. Rejects backward or repeat-terminal moves with
    /// `IllegalTransition`, leaving the record untouched.
    pub async fn update_status(
        &self,
        task_id: &str,
        to: TaskStatus,
        details: UpdateDetails,
    ) -> Result<(TaskStatus, AgentTask), HubError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| HubError::not_found("task", task_id))?;
        let from = task.status;
        check_transition(from, to)?;

        task.status = to;
        task.updated_at = Utc::now();
        if let Some(result) = details.result {
            task.result = Some(result);
        }
        if let Some(error) = details.error {
            task.error = Some(error);
        }
        if let Some(metadata) = details.metadata {
            task.metadata = Some(metadata);
        }
        task.updates.push(TaskUpdateEntry {
            status: to,
            timestamp: task.updated_at,
            message: details.message,
            data: None,
        });
        let snapshot = task.clone();
        drop(tasks);

        if from != to {
            self.bus.publish(HubEvent::TaskUpdated {
                task_id: task_id.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        Ok((from, snapshot))
    }

    /// Journal a notification without touching `status`. Legal after a
    /// terminal status.
    pub async fn append_update(
        &self,
        task_id: &str,
        message: Option<String>,
        data: Option<Value>,
    ) -> Result<AgentTask, HubError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| HubError::not_found("task", task_id))?;
        task.updates.push(TaskUpdateEntry {
            status: task.status,
            timestamp: Utc::now(),
            message,
            data,
        });
        Ok(task.clone())
    }

    pub async fn get(&self, task_id: &str) -> Option<AgentTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        agent_id: Option<&str>,
    ) -> Vec<AgentTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| agent_id.map_or(true, |a| t.agent_id == a))
            .cloned()
            .collect()
    }

    /// Non-terminal tasks assigned to an agent (disconnect cleanup).
    pub async fn open_for_agent(&self, agent_id: &str) -> Vec<AgentTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.agent_id == agent_id && !t.status.is_terminal())
            .cloned()
            .collect()
    }
}
