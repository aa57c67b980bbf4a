//! Agent task flows: creation, dispatch, delegation, outcomes, and the
//! intermediate message channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use apiary_core::message::{
    AgentTaskRequest, ClientMessage, ClientTaskCreate, TaskErrorReport, TaskMessage,
    TaskNotification, TaskRef, TaskResultReport, TaskStatusReport,
};
use apiary_core::{Frame, HubError, PeerKind, DEFAULT_REQUEST_TIMEOUT};
use apiary_gateway::ConnectionMap;
use apiary_registry::{
    AgentTask, ClientRegistry, NewAgentTask, PeerRegistry, TaskRegistry, TaskStatus, UpdateDetails,
};

use crate::router::Router;

/// The slice of the router a spawned dispatch task needs.
#[derive(Clone)]
pub(crate) struct TaskCtx {
    pub tasks: Arc<TaskRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub agents: Arc<PeerRegistry>,
    pub connections: Arc<ConnectionMap>,
}

impl TaskCtx {
    /// Fail a task and notify its originators. Used for dispatch failures
    /// and agent-disconnect cleanup; a task already terminal is left alone.
    pub async fn fail_task(&self, task_id: &str, error: Value) {
        let updated = self
            .tasks
            .update_status(
                task_id,
                TaskStatus::Failed,
                UpdateDetails {
                    message: error.as_str().map(String::from),
                    error: Some(error.clone()),
                    ..Default::default()
                },
            )
            .await;
        match updated {
            Ok((_, task)) => self.notify_failed(&task, &error).await,
            Err(e) => tracing::debug!("task {} not failed: {}", task_id, e),
        }
    }

    /// `task.error` to the client, `childagent.response {failed}` to the
    /// requesting agent. A disconnected requester is dropped silently; the
    /// terminal record stays.
    pub async fn notify_failed(&self, task: &AgentTask, error: &Value) {
        if let Some(client_id) = &task.client_id {
            if let Some(conn) = self.clients.connection_for(client_id).await {
                let _ = self.connections.send(
                    &conn,
                    Frame::new(
                        "task.error",
                        json!({"taskId": task.id, "error": error, "status": "failed"}),
                    ),
                );
            }
        }
        if let Some(requester_id) = &task.requesting_agent_id {
            if let Some(conn) = self.agent_connection(requester_id).await {
                let _ = self.connections.send(
                    &conn,
                    Frame::new(
                        "childagent.response",
                        json!({"childTaskId": task.id, "status": "failed", "error": error}),
                    ),
                );
            }
        }
    }

    async fn agent_connection(&self, agent_id: &str) -> Option<String> {
        self.agents.get(agent_id).await?.connection_id
    }

    /// Send `task.execute` through send-and-await. The correlated reply (a
    /// `task.result`/`task.error` for this task) is also routed normally,
    /// so a timeout here only logs: a task is failed by an explicit
    /// `task.error` or agent disconnect, never by the dispatch deadline.
    pub async fn dispatch_execute(
        &self,
        task_id: String,
        agent_connection: Option<String>,
        execute: Frame,
        timeout: Duration,
    ) {
        let Some(connection_id) = agent_connection else {
            self.fail_task(&task_id, json!("Agent connection not found"))
                .await;
            return;
        };
        // Dispatch-side progress marker; the agent's own update may race it.
        let _ = self
            .tasks
            .update_status(
                &task_id,
                TaskStatus::InProgress,
                UpdateDetails {
                    message: Some("Dispatched to agent".to_string()),
                    ..Default::default()
                },
            )
            .await;

        let wanted = task_id.clone();
        let filter = Box::new(move |f: &Frame| {
            matches!(f.kind.as_str(), "task.result" | "task.error")
                && f.content.get("taskId").and_then(Value::as_str) == Some(wanted.as_str())
        });
        match self
            .connections
            .request(&connection_id, execute, timeout, Some(filter))
            .await
        {
            Ok(_) => {}
            Err(HubError::Timeout { .. }) => {
                tracing::warn!("task {}: no reply within dispatch deadline", task_id);
            }
            Err(e) => {
                tracing::warn!("task {}: dispatch failed: {}", task_id, e);
                self.fail_task(&task_id, json!("Agent connection not found"))
                    .await;
            }
        }
    }
}

impl Router {
    pub(crate) fn task_ctx(&self) -> TaskCtx {
        TaskCtx {
            tasks: self.tasks.clone(),
            clients: self.clients.clone(),
            agents: self.agents.clone(),
            connections: self.connections.clone(),
        }
    }

    pub(crate) async fn fail_open_agent_tasks(&self, agent_id: &str, reason: &str) {
        let ctx = self.task_ctx();
        for task in self.tasks.open_for_agent(agent_id).await {
            ctx.fail_task(&task.id, json!(reason)).await;
        }
    }

    /// `client.agent.task.create.request`: create, acknowledge immediately,
    /// then dispatch to the agent off the reader task.
    pub(crate) async fn handle_client_task_create(
        &self,
        connection_id: &str,
        frame: &Frame,
        create: ClientTaskCreate,
    ) -> Result<(), HubError> {
        let client = self
            .clients
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| HubError::unknown_identity("client connection not tracked"))?;
        let wanted = create
            .agent_id
            .clone()
            .or_else(|| create.agent_name.clone())
            .unwrap_or_default();
        let agent = self
            .agents
            .resolve(create.agent_id.as_deref(), create.agent_name.as_deref())
            .await
            .ok_or_else(|| HubError::not_found("agent", wanted))?;

        let task = self
            .tasks
            .create(NewAgentTask {
                task_type: create.task_type,
                name: create.name,
                agent_id: agent.id.clone(),
                client_id: Some(client.id.clone()),
                task_data: create.task_data.clone(),
                ..Default::default()
            })
            .await?;

        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                "task.created",
                json!({
                    "taskId": task.id,
                    "agentId": agent.id,
                    "agentName": agent.name,
                    "status": task.status.as_str(),
                }),
            ),
        )?;

        let execute = Frame::new(
            "task.execute",
            json!({
                "taskId": task.id,
                "taskData": create.task_data,
                "clientId": client.id,
            }),
        );
        let ctx = self.task_ctx();
        let agent_connection = agent.connection_id;
        tokio::spawn(async move {
            ctx.dispatch_execute(task.id, agent_connection, execute, DEFAULT_REQUEST_TIMEOUT)
                .await;
        });
        Ok(())
    }

    /// `client.agent.task.status.request`: snapshot reply.
    pub(crate) async fn handle_task_status_request(
        &self,
        connection_id: &str,
        frame: &Frame,
        task: TaskRef,
    ) -> Result<(), HubError> {
        let record = self
            .tasks
            .get(&task.task_id)
            .await
            .ok_or_else(|| HubError::not_found("task", task.task_id.as_str()))?;
        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                "task.status",
                json!({
                    "taskId": record.id,
                    "status": record.status.as_str(),
                    "result": record.result,
                    "error": record.error,
                    "updatedAt": record.updated_at,
                }),
            ),
        )
    }

    /// `agent.task.request`: child-agent delegation.
    pub(crate) async fn handle_agent_delegation(
        &self,
        connection_id: &str,
        frame: &Frame,
        request: AgentTaskRequest,
    ) -> Result<(), HubError> {
        let requester = self
            .agents
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| HubError::unknown_identity("agent not registered"))?;
        let target = self
            .agents
            .get_by_name(&request.target_agent_name)
            .await
            .ok_or_else(|| HubError::not_found("agent", request.target_agent_name.as_str()))?;

        let task = self
            .tasks
            .create(NewAgentTask {
                task_type: request.task_type.clone(),
                agent_id: target.id.clone(),
                requesting_agent_id: Some(requester.id.clone()),
                parent_task_id: request.parent_task_id.clone(),
                task_data: request.task_data.clone(),
                ..Default::default()
            })
            .await?;

        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                "childagent.request.accepted",
                json!({"childTaskId": task.id, "targetAgentName": target.name}),
            ),
        )?;

        let execute = Frame::new(
            "task.execute",
            json!({
                "taskId": task.id,
                "taskType": request.task_type,
                "taskData": request.task_data,
                "parentTaskId": request.parent_task_id,
                "requestingAgentId": requester.id,
            }),
        );
        let timeout = request
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let ctx = self.task_ctx();
        let target_connection = target.connection_id;
        tokio::spawn(async move {
            ctx.dispatch_execute(task.id, target_connection, execute, timeout)
                .await;
        });
        Ok(())
    }

    /// `task.status` from the executing agent: forward to the client.
    pub(crate) async fn handle_task_status(
        &self,
        _connection_id: &str,
        _frame: &Frame,
        report: TaskStatusReport,
    ) -> Result<(), HubError> {
        let status = TaskStatus::parse(&report.status)
            .ok_or_else(|| HubError::invalid(format!("unknown task status '{}'", report.status)))?;
        let (_, task) = self
            .tasks
            .update_status(
                &report.task_id,
                status,
                UpdateDetails {
                    message: report.message.clone(),
                    result: report.result.clone(),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(conn) = self.client_connection_for(&task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "task.status",
                    json!({
                        "taskId": task.id,
                        "status": report.status,
                        "message": report.message,
                        "result": report.result,
                    }),
                ),
            );
        }
        Ok(())
    }

    /// `task.result`: terminal success. The client sees `task.status
    /// {completed}` then the standalone `task.result`; a delegating agent
    /// gets `childagent.response`.
    pub(crate) async fn handle_task_result(
        &self,
        _connection_id: &str,
        _frame: &Frame,
        report: TaskResultReport,
    ) -> Result<(), HubError> {
        let (_, task) = self
            .tasks
            .update_status(
                &report.task_id,
                TaskStatus::Completed,
                UpdateDetails {
                    result: Some(report.result.clone()),
                    metadata: report.metadata.clone(),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(conn) = self.client_connection_for(&task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "task.status",
                    json!({"taskId": task.id, "status": "completed", "result": &report.result}),
                ),
            );
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "task.result",
                    json!({"taskId": task.id, "result": &report.result, "status": "completed"}),
                ),
            );
        }

        if let Some(requester_id) = &task.requesting_agent_id {
            match self.agents.get(requester_id).await.and_then(|a| a.connection_id) {
                Some(conn) => {
                    let _ = self.connections.send(
                        &conn,
                        Frame::new(
                            "childagent.response",
                            json!({
                                "childTaskId": task.id,
                                "status": "completed",
                                "result": &report.result,
                            }),
                        ),
                    );
                }
                // Requester gone: drop silently, keep the terminal record.
                None => tracing::debug!(
                    "task {}: requesting agent {} disconnected, dropping result",
                    task.id,
                    requester_id
                ),
            }
        }
        Ok(())
    }

    /// `task.error`: terminal failure reported by the agent.
    pub(crate) async fn handle_task_error(
        &self,
        _connection_id: &str,
        _frame: &Frame,
        report: TaskErrorReport,
    ) -> Result<(), HubError> {
        let task_id = report
            .task_id
            .ok_or_else(|| HubError::invalid("task.error requires a taskId"))?;
        let (_, task) = self
            .tasks
            .update_status(
                &task_id,
                TaskStatus::Failed,
                UpdateDetails {
                    error: Some(report.error.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.task_ctx().notify_failed(&task, &report.error).await;
        Ok(())
    }

    /// `task.notification`: journal + forward, never a status change.
    pub(crate) async fn handle_task_notification(
        &self,
        connection_id: &str,
        frame: &Frame,
        notification: TaskNotification,
    ) -> Result<(), HubError> {
        let task_id = notification
            .task_id
            .clone()
            .ok_or_else(|| HubError::invalid("task.notification requires a taskId"))?;
        let sender = self.agents.get_by_connection(connection_id).await;
        let task = self
            .tasks
            .append_update(
                &task_id,
                notification.message.clone(),
                notification.data.clone(),
            )
            .await?;

        if let Some(conn) = self.client_connection_for(&task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "task.notification",
                    json!({
                        "taskId": task.id,
                        "notificationType": notification.notification_type,
                        "message": notification.message,
                        "data": notification.data,
                        "agentId": sender.as_ref().map(|a| a.id.clone()),
                        "agentName": sender.as_ref().map(|a| a.name.clone()),
                    }),
                ),
            );
        }
        self.connections.send(
            connection_id,
            Frame::reply(frame, "notification.received", json!({"taskId": task.id})),
        )
    }

    /// Intermediate messages route by task id to the opposite party.
    pub(crate) async fn route_task_message(
        &self,
        kind: PeerKind,
        connection_id: &str,
        frame: &Frame,
        message: TaskMessage,
    ) -> Result<(), HubError> {
        let task = self
            .tasks
            .get(&message.task_id)
            .await
            .ok_or_else(|| HubError::not_found("task", message.task_id.as_str()))?;
        match kind {
            PeerKind::Client => {
                let conn = self
                    .agents
                    .get(&task.agent_id)
                    .await
                    .and_then(|a| a.connection_id)
                    .ok_or_else(|| HubError::unavailable("agent connection not found"))?;
                self.connections.send(
                    &conn,
                    Frame::new(
                        "task.messageresponse",
                        json!({
                            "taskId": task.id,
                            "message": message.message,
                            "clientId": task.client_id,
                        }),
                    ),
                )?;
                self.connections.send(
                    connection_id,
                    Frame::reply(frame, "message.sent", json!({"taskId": task.id})),
                )
            }
            PeerKind::Agent => {
                let conn = self
                    .client_connection_for(&task)
                    .await
                    .ok_or_else(|| HubError::unavailable("client connection not found"))?;
                self.connections.send(
                    &conn,
                    Frame::new(
                        "task.message",
                        json!({
                            "taskId": task.id,
                            "message": message.message,
                            "agentId": task.agent_id,
                        }),
                    ),
                )
            }
            PeerKind::Service => Err(HubError::invalid(
                "task.message is not accepted on the service endpoint",
            )),
        }
    }

    /// `client.message`: task-less message to an agent.
    pub(crate) async fn handle_client_message(
        &self,
        connection_id: &str,
        frame: &Frame,
        message: ClientMessage,
    ) -> Result<(), HubError> {
        let client = self
            .clients
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| HubError::unknown_identity("client connection not tracked"))?;
        let wanted = message
            .target_agent_id
            .clone()
            .or_else(|| message.target_agent_name.clone())
            .unwrap_or_default();
        let agent = self
            .agents
            .resolve(
                message.target_agent_id.as_deref(),
                message.target_agent_name.as_deref(),
            )
            .await
            .ok_or_else(|| HubError::not_found("agent", wanted))?;
        let conn = agent.connection_id.ok_or_else(|| {
            HubError::unavailable(format!("agent '{}' is offline", agent.name))
        })?;

        self.connections.send(
            &conn,
            Frame::new(
                "task.messageresponse",
                json!({
                    "message": message.message,
                    "clientId": client.id,
                    "clientName": client.name,
                }),
            ),
        )?;
        self.connections.send(
            connection_id,
            Frame::reply(frame, "message.sent", json!({"agentId": agent.id})),
        )
    }

    pub(crate) async fn client_connection_for(&self, task: &AgentTask) -> Option<String> {
        let client_id = task.client_id.as_ref()?;
        self.clients.connection_for(client_id).await
    }
}
