//! Service task registry: same lifecycle law as agent tasks, keyed
//! additionally by the service executing the tool call.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::tasks::{check_transition, TaskStatus, TaskUpdateEntry, UpdateDetails};
use apiary_core::{HubBus, HubError, HubEvent};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTask {
    pub id: String,
    pub service_id: String,
    /// Agent that invoked the service.
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub tool_name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub updates: Vec<TaskUpdateEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct NewServiceTask {
    pub service_id: String,
    pub agent_id: String,
    pub client_id: Option<String>,
    pub tool_name: String,
    pub params: Value,
}

pub struct ServiceTaskRegistry {
    bus: HubBus,
    tasks: RwLock<HashMap<String, ServiceTask>>,
}

impl ServiceTaskRegistry {
    pub fn new(bus: HubBus) -> Self {
        Self {
            bus,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, new: NewServiceTask) -> Result<ServiceTask, HubError> {
        if new.service_id.is_empty() {
            return Err(HubError::invalid("service task requires a serviceId"));
        }
        let now = Utc::now();
        let task = ServiceTask {
            id: Uuid::new_v4().to_string(),
            service_id: new.service_id,
            agent_id: new.agent_id,
            client_id: new.client_id,
            tool_name: new.tool_name,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            params: new.params,
            result: None,
            error: None,
            updates: vec![TaskUpdateEntry {
                status: TaskStatus::Pending,
                timestamp: now,
                message: Some("Service task created".to_string()),
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

    pub async fn update_status(
        &self,
        task_id: &str,
        to: TaskStatus,
        details: UpdateDetails,
    ) -> Result<(TaskStatus, ServiceTask), HubError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| HubError::not_found("service task", task_id))?;
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

    pub async fn append_update(
        &self,
        task_id: &str,
        message: Option<String>,
        data: Option<Value>,
    ) -> Result<ServiceTask, HubError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| HubError::not_found("service task", task_id))?;
        task.updates.push(TaskUpdateEntry {
            status: task.status,
            timestamp: Utc::now(),
            message,
            data,
        });
        Ok(task.clone())
    }

    pub async fn get(&self, task_id: &str) -> Option<ServiceTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn open_for_service(&self, service_id: &str) -> Vec<ServiceTask> {
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.service_id == service_id && !t.status.is_terminal())
            .cloned()
            .collect()
    }
}
