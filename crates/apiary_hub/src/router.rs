//! The message handler: every decoded frame lands here.
//!
//! The router owns the registries and the MCP supervisor handle, consumes
//! typed messages, and produces registry mutations plus outbound frames. It
//! never writes to a transport directly; everything goes through the
//! connection map's send helpers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use apiary_core::{Frame, HubBus, HubError, Message, PeerKind, HUB_VERSION};
use apiary_gateway::{ConnectionMap, FrameHandler};
use apiary_mcp::McpSupervisor;
use apiary_registry::{ClientRegistry, PeerRegistry, ServiceTaskRegistry, TaskRegistry};

pub struct Router {
    pub(crate) agents: Arc<PeerRegistry>,
    pub(crate) services: Arc<PeerRegistry>,
    pub(crate) clients: Arc<ClientRegistry>,
    pub(crate) tasks: Arc<TaskRegistry>,
    pub(crate) service_tasks: Arc<ServiceTaskRegistry>,
    pub(crate) connections: Arc<ConnectionMap>,
    pub(crate) mcp: Arc<McpSupervisor>,
}

impl Router {
    pub fn new(
        connections: Arc<ConnectionMap>,
        mcp: Arc<McpSupervisor>,
        bus: HubBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            agents: Arc::new(PeerRegistry::new(PeerKind::Agent, bus.clone())),
            services: Arc::new(PeerRegistry::new(PeerKind::Service, bus.clone())),
            clients: Arc::new(ClientRegistry::new(bus.clone())),
            tasks: Arc::new(TaskRegistry::new(bus.clone())),
            service_tasks: Arc::new(ServiceTaskRegistry::new(bus.clone())),
            connections,
            mcp,
        })
    }

    pub fn agents(&self) -> &Arc<PeerRegistry> {
        &self.agents
    }

    pub fn services(&self) -> &Arc<PeerRegistry> {
        &self.services
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn service_tasks(&self) -> &Arc<ServiceTaskRegistry> {
        &self.service_tasks
    }

    async fn dispatch(
        &self,
        kind: PeerKind,
        connection_id: &str,
        frame: &Frame,
        message: Message,
    ) -> Result<(), HubError> {
        use Message::*;
        match (kind, message) {
            // Health: no state change, echo the request id.
            (_, Ping(_)) => {
                let pong = Frame::reply(
                    frame,
                    "pong",
                    json!({"timestamp": chrono::Utc::now().to_rfc3339()}),
                );
                self.connections.send(connection_id, pong)
            }
            // A reply to a hub ping; the correlator already saw it.
            (_, Pong) => Ok(()),

            (PeerKind::Agent, AgentRegister(reg)) => {
                self.handle_peer_register(&self.agents, connection_id, frame, reg, "agent.registered")
                    .await
            }
            (PeerKind::Service, ServiceRegister(reg)) => {
                self.handle_peer_register(
                    &self.services,
                    connection_id,
                    frame,
                    reg,
                    "service.registered",
                )
                .await
            }
            (PeerKind::Client, ClientRegister(reg)) => {
                self.handle_client_register(connection_id, frame, reg).await
            }

            (PeerKind::Agent, AgentListRequest(filter)) => {
                self.handle_agent_list(connection_id, frame, filter, "agent.list.response")
                    .await
            }
            (PeerKind::Client, ClientAgentListRequest(filter)) => {
                self.handle_agent_list(connection_id, frame, filter, "agent.list")
                    .await
            }
            (PeerKind::Agent, ServiceListRequest(filter)) => {
                self.handle_service_list(connection_id, frame, filter).await
            }
            (PeerKind::Client, ClientListRequest) => {
                self.handle_client_list(connection_id, frame).await
            }
            (PeerKind::Agent, ServiceToolsList(service)) => {
                self.handle_service_tools(connection_id, frame, service).await
            }

            (PeerKind::Agent, AgentStatusUpdate(update)) => {
                self.agents
                    .update_status(connection_id, update.status.as_deref(), update.details)
                    .await?;
                Ok(())
            }
            (PeerKind::Service, ServiceStatusUpdate(update)) => {
                let record = self
                    .services
                    .update_status(connection_id, update.status.as_deref(), update.details)
                    .await?;
                self.connections.send(
                    connection_id,
                    Frame::reply(
                        frame,
                        "service.status.updated",
                        json!({"serviceId": record.id, "status": record.status.as_str()}),
                    ),
                )
            }

            (PeerKind::Client, ClientTaskCreate(create)) => {
                self.handle_client_task_create(connection_id, frame, create)
                    .await
            }
            (PeerKind::Client, ClientTaskStatusRequest(task)) => {
                self.handle_task_status_request(connection_id, frame, task)
                    .await
            }
            (PeerKind::Agent, AgentTaskRequest(request)) => {
                self.handle_agent_delegation(connection_id, frame, request)
                    .await
            }
            (PeerKind::Agent, ServiceTaskExecute(execute)) => {
                self.handle_service_invocation(connection_id, frame, execute)
                    .await
            }

            (PeerKind::Agent, TaskStatus(report)) => {
                self.handle_task_status(connection_id, frame, report).await
            }
            (PeerKind::Agent, TaskResult(report)) => {
                self.handle_task_result(connection_id, frame, report).await
            }
            (PeerKind::Agent, TaskError(report)) => {
                self.handle_task_error(connection_id, frame, report).await
            }
            (PeerKind::Agent, TaskNotification(notification)) => {
                self.handle_task_notification(connection_id, frame, notification)
                    .await
            }

            (PeerKind::Service, ServiceTaskResult(report)) => {
                self.handle_service_task_result(connection_id, frame, report)
                    .await
            }
            (PeerKind::Service, ServiceTaskNotification(notification)) => {
                self.handle_service_task_notification(connection_id, frame, notification)
                    .await
            }
            (PeerKind::Service, ServiceError(report)) => {
                self.handle_service_error(connection_id, frame, report).await
            }

            (_, TaskMessage(message)) | (_, TaskMessageResponse(message)) => {
                self.route_task_message(kind, connection_id, frame, message)
                    .await
            }
            (PeerKind::Client, ClientMessage(message)) => {
                self.handle_client_message(connection_id, frame, message)
                    .await
            }

            (PeerKind::Agent | PeerKind::Client, McpServersList) => {
                self.handle_mcp_servers_list(kind, connection_id, frame).await
            }
            (PeerKind::Agent | PeerKind::Client, McpToolsList(server)) => {
                self.handle_mcp_tools_list(kind, connection_id, frame, server)
                    .await
            }
            (PeerKind::Agent | PeerKind::Client, McpToolExecute(execute)) => {
                self.handle_mcp_tool_execute(kind, connection_id, frame, execute)
                    .await
            }

            // Catalogued type on the wrong endpoint.
            (kind, _) => Err(HubError::invalid(format!(
                "{} is not accepted on the {} endpoint",
                frame.kind, kind
            ))),
        }
    }
}

#[async_trait]
impl FrameHandler for Router {
    async fn on_connect(&self, kind: PeerKind, connection_id: &str) -> Option<Frame> {
        match kind {
            PeerKind::Agent | PeerKind::Service => {
                let registry = if kind == PeerKind::Agent {
                    &self.agents
                } else {
                    &self.services
                };
                registry.add_pending(connection_id).await;
                Some(Frame::new(
                    "orchestrator.welcome",
                    json!({"connectionId": connection_id, "version": HUB_VERSION}),
                ))
            }
            PeerKind::Client => {
                let record = self.clients.connect(connection_id).await;
                Some(Frame::new(
                    "orchestrator.client.welcome",
                    json!({
                        "clientId": record.id,
                        "connectionId": connection_id,
                        "version": HUB_VERSION,
                    }),
                ))
            }
        }
    }

    async fn on_frame(&self, kind: PeerKind, connection_id: &str, frame: Frame) {
        if kind == PeerKind::Client {
            self.clients.touch(connection_id).await;
        }
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("{} frame rejected: {}", kind, e);
                self.connections
                    .send_error(connection_id, &e, Some(frame.id.clone()), None);
                return;
            }
        };
        if let Err(e) = self.dispatch(kind, connection_id, &frame, message).await {
            self.connections
                .send_error(connection_id, &e, Some(frame.id.clone()), None);
        }
    }

    async fn on_disconnect(&self, kind: PeerKind, connection_id: &str) {
        match kind {
            PeerKind::Agent => {
                if let Some(record) = self.agents.handle_disconnect(connection_id).await {
                    self.fail_open_agent_tasks(&record.id, "Agent disconnected")
                        .await;
                }
            }
            PeerKind::Service => {
                if let Some(record) = self.services.handle_disconnect(connection_id).await {
                    self.fail_open_service_tasks(&record.id, "Service disconnected")
                        .await;
                }
            }
            PeerKind::Client => {
                self.clients.handle_disconnect(connection_id).await;
            }
        }
    }
}
