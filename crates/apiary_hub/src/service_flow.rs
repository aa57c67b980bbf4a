//! Service invocation flows: agents call tools on services, clients watch.

use serde_json::{json, Value};

use apiary_core::message::{ServiceTaskExecute, TaskErrorReport, TaskNotification, TaskResultReport};
use apiary_core::{Frame, HubError};
use apiary_registry::{NewServiceTask, ServiceTask, TaskStatus, UpdateDetails};

use crate::router::Router;

impl Router {
    /// `service.task.execute` from an agent: create the service task, tell
    /// the watching client, dispatch to the service, acknowledge the agent.
    pub(crate) async fn handle_service_invocation(
        &self,
        connection_id: &str,
        frame: &Frame,
        execute: ServiceTaskExecute,
    ) -> Result<(), HubError> {
        let requester = self
            .agents
            .get_by_connection(connection_id)
            .await
            .ok_or_else(|| HubError::unknown_identity("agent not registered"))?;
        let service = self
            .services
            .resolve(
                Some(execute.service_id.as_str()),
                Some(execute.service_id.as_str()),
            )
            .await
            .ok_or_else(|| HubError::not_found("service", execute.service_id.as_str()))?;

        let task = self
            .service_tasks
            .create(NewServiceTask {
                service_id: service.id.clone(),
                agent_id: requester.id.clone(),
                client_id: execute.client_id.clone(),
                tool_name: execute.tool_name.clone(),
                params: execute.params.clone(),
            })
            .await?;

        if let Some(client_id) = &execute.client_id {
            if let Some(conn) = self.clients.connection_for(client_id).await {
                let _ = self.connections.send(
                    &conn,
                    Frame::new(
                        "service.started",
                        json!({
                            "serviceTaskId": task.id,
                            "serviceName": &service.name,
                            "toolName": &execute.tool_name,
                        }),
                    ),
                );
            }
        }

        let service_connection = service.connection_id.clone().ok_or_else(|| {
            HubError::unavailable(format!("service '{}' is offline", service.name))
        });
        let service_connection = match service_connection {
            Ok(conn) => conn,
            Err(e) => {
                self.fail_service_task(&task.id, json!(e.to_string())).await;
                return Err(e);
            }
        };

        let dispatch = self.connections.send(
            &service_connection,
            Frame::new(
                "service.task.execute",
                json!({
                    "taskId": task.id,
                    "toolName": execute.tool_name,
                    "params": execute.params,
                    "agentId": requester.id,
                    "clientId": execute.client_id,
                }),
            ),
        );
        if let Err(e) = dispatch {
            self.fail_service_task(&task.id, json!(e.to_string())).await;
            return Err(e);
        }

        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                "service.request.accepted",
                json!({"serviceTaskId": task.id, "serviceName": service.name}),
            ),
        )
    }

    /// `service.task.result`: terminal success from the service.
    pub(crate) async fn handle_service_task_result(
        &self,
        _connection_id: &str,
        _frame: &Frame,
        report: TaskResultReport,
    ) -> Result<(), HubError> {
        let (_, task) = self
            .service_tasks
            .update_status(
                &report.task_id,
                TaskStatus::Completed,
                UpdateDetails {
                    result: Some(report.result.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let service_name = self.service_name(&task).await;

        if let Some(conn) = self.service_client_connection(&task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "service.completed",
                    json!({
                        "serviceTaskId": task.id,
                        "result": &report.result,
                        "serviceName": &service_name,
                    }),
                ),
            );
        }
        if let Some(conn) = self.service_agent_connection(&task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "service.response",
                    json!({
                        "serviceTaskId": task.id,
                        "status": "completed",
                        "result": &report.result,
                        "serviceName": &service_name,
                    }),
                ),
            );
        }
        Ok(())
    }

    /// `service.task.notification`: journal + fan out; status untouched.
    /// Forwarded to the agent only when the notification names one.
    pub(crate) async fn handle_service_task_notification(
        &self,
        connection_id: &str,
        frame: &Frame,
        notification: TaskNotification,
    ) -> Result<(), HubError> {
        let task_id = notification
            .task_id
            .clone()
            .ok_or_else(|| HubError::invalid("service.task.notification requires a taskId"))?;
        let sender = self.services.get_by_connection(connection_id).await;
        let task = self
            .service_tasks
            .append_update(
                &task_id,
                notification.message.clone(),
                notification.data.clone(),
            )
            .await?;

        let content = json!({
            "serviceTaskId": task.id,
            "notificationType": notification.notification_type,
            "message": notification.message,
            "data": notification.data,
            "serviceId": sender.as_ref().map(|s| s.id.clone()),
            "serviceName": sender.as_ref().map(|s| s.name.clone()),
        });
        if let Some(conn) = self.service_client_connection(&task).await {
            let _ = self
                .connections
                .send(&conn, Frame::new("service.notification", content.clone()));
        }
        if let Some(agent_id) = &notification.agent_id {
            if let Some(conn) = self
                .agents
                .get(agent_id)
                .await
                .and_then(|a| a.connection_id)
            {
                let _ = self
                    .connections
                    .send(&conn, Frame::new("service.notification", content));
            }
        }
        self.connections.send(
            connection_id,
            Frame::reply(frame, "notification.received", json!({"taskId": task.id})),
        )
    }

    /// `service.error`: terminal failure from the service.
    pub(crate) async fn handle_service_error(
        &self,
        connection_id: &str,
        _frame: &Frame,
        report: TaskErrorReport,
    ) -> Result<(), HubError> {
        match report.task_id {
            Some(task_id) => {
                let (_, task) = self
                    .service_tasks
                    .update_status(
                        &task_id,
                        TaskStatus::Failed,
                        UpdateDetails {
                            error: Some(report.error.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.notify_service_failed(&task, &report.error).await;
                Ok(())
            }
            None => {
                let sender = self.services.get_by_connection(connection_id).await;
                tracing::warn!(
                    "service '{}' reported an error outside any task: {}",
                    sender.map(|s| s.name).unwrap_or_default(),
                    report.error
                );
                Ok(())
            }
        }
    }

    pub(crate) async fn fail_open_service_tasks(&self, service_id: &str, reason: &str) {
        for task in self.service_tasks.open_for_service(service_id).await {
            self.fail_service_task(&task.id, json!(reason)).await;
        }
    }

    pub(crate) async fn fail_service_task(&self, task_id: &str, error: Value) {
        let updated = self
            .service_tasks
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
            Ok((_, task)) => self.notify_service_failed(&task, &error).await,
            Err(e) => tracing::debug!("service task {} not failed: {}", task_id, e),
        }
    }

    async fn notify_service_failed(&self, task: &ServiceTask, error: &Value) {
        let service_name = self.service_name(task).await;
        if let Some(conn) = self.service_client_connection(task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "service.notification",
                    json!({
                        "serviceTaskId": task.id,
                        "status": "failed",
                        "error": error,
                        "serviceName": service_name,
                    }),
                ),
            );
        }
        if let Some(conn) = self.service_agent_connection(task).await {
            let _ = self.connections.send(
                &conn,
                Frame::new(
                    "service.response",
                    json!({
                        "serviceTaskId": task.id,
                        "status": "failed",
                        "error": error,
                        "serviceName": service_name,
                    }),
                ),
            );
        }
    }

    async fn service_name(&self, task: &ServiceTask) -> String {
        self.services
            .get(&task.service_id)
            .await
            .map(|s| s.name)
            .unwrap_or_default()
    }

    async fn service_client_connection(&self, task: &ServiceTask) -> Option<String> {
        let client_id = task.client_id.as_ref()?;
        self.clients.connection_for(client_id).await
    }

    async fn service_agent_connection(&self, task: &ServiceTask) -> Option<String> {
        self.agents.get(&task.agent_id).await?.connection_id
    }
}
