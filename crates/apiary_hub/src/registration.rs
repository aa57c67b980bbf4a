//! Registration handlers for all three endpoints.

use std::sync::Arc;

use serde_json::json;

use apiary_core::message::{ClientRegister, RegisterPeer};
use apiary_core::{Frame, HubError};
use apiary_registry::PeerRegistry;

use crate::router::Router;

impl Router {
    /// `agent.register` / `service.register`: promote the pending connection
    /// and echo the assigned identity.
    pub(crate) async fn handle_peer_register(
        &self,
        registry: &Arc<PeerRegistry>,
        connection_id: &str,
        frame: &Frame,
        register: RegisterPeer,
        reply_kind: &str,
    ) -> Result<(), HubError> {
        let name = register
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                HubError::unknown_identity(format!("{} requires a name", frame.kind))
            })?;

        let record = registry
            .register(connection_id, register.id, name, register.capabilities)
            .await?;
        tracing::info!(
            "{} '{}' registered as {} on {}",
            registry.kind(),
            record.name,
            record.id,
            connection_id
        );
        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                reply_kind,
                json!({
                    "id": record.id,
                    "name": record.name,
                    "capabilities": record.capabilities,
                    "status": record.status.as_str(),
                }),
            ),
        )
    }

    /// `client.register`: upsert name/metadata on the connection's record.
    pub(crate) async fn handle_client_register(
        &self,
        connection_id: &str,
        frame: &Frame,
        register: ClientRegister,
    ) -> Result<(), HubError> {
        let record = self
            .clients
            .register(connection_id, register.name, register.metadata)
            .await
            .ok_or_else(|| HubError::unknown_identity("client connection not tracked"))?;
        self.connections.send(
            connection_id,
            Frame::reply(
                frame,
                "client.register.response",
                json!({
                    "clientId": record.id,
                    "name": record.name,
                    "status": record.status.as_str(),
                }),
            ),
        )
    }
}
