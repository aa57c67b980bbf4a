//! Directory queries: pure reads replying with filtered snapshots.

use serde_json::json;

use apiary_core::message::{PeerFilter, ServiceRef};
use apiary_core::{Frame, HubError};

use crate::router::Router;

impl Router {
    pub(crate) async fn handle_agent_list(
        &self,
        connection_id: &str,
        frame: &Frame,
        filter: PeerFilter,
        reply_kind: &str,
    ) -> Result<(), HubError> {
        let agents = self
            .agents
            .list(filter.status.as_deref(), filter.capabilities.as_deref())
            .await;
        self.connections.send(
            connection_id,
            Frame::reply(frame, reply_kind, json!({"agents": agents})),
        )
    }

    pub(crate) async fn handle_service_list(
        &self,
        connection_id: &str,
        frame: &Frame,
        filter: PeerFilter,
    ) -> Result<(), HubError> {
        let services = self
            .services
            .list(filter.status.as_deref(), filter.capabilities.as_deref())
            .await;
        self.connections.send(
            connection_id,
            Frame::reply(frame, "service.list.result", json!({"services": services})),
        )
    }

    pub(crate) async fn handle_client_list(
        &self,
        connection_id: &str,
        frame: &Frame,
    ) -> Result<(), HubError> {
        let clients = self.clients.list().await;
        self.connections.send(
            connection_id,
            Frame::reply(frame, "client.list.response", json!({"clients": clients})),
        )
    }

    /// `service.tools.list`: a service's advertised capabilities, shaped as
    /// its tool directory.
    pub(crate) async fn handle_service_tools(
        &self,
        connection_id: &str,
        frame: &Frame,
        service: ServiceRef,
    ) -> Result<(), HubError> {
        let record = self
            .services
            .resolve(Some(service.service_id.as_str()), Some(service.service_id.as_str()))
            .await
            .ok_or_else(|| HubError::not_found("service", service.service_id.as_str()))?;
        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                "service.list.result",
                json!({
                    "serviceId": record.id,
                    "serviceName": record.name,
                    "tools": record.capabilities,
                }),
            ),
        )
    }
}
