//! Hub assembly: binds the three endpoints, wires the router to the
//! registries, the connection map, the MCP supervisor, and the event bus.
//! All process-wide state lives here and is torn down by [`Hub::stop`].

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;

use apiary_core::{Frame, HubBus, HubConfig, HubEvent, PeerKind};
use apiary_gateway::{ConnectionMap, FrameHandler, ListenerHandle};
use apiary_mcp::McpSupervisor;
use apiary_registry::ClientRegistry;

use crate::router::Router;

pub struct Hub {
    router: Arc<Router>,
    connections: Arc<ConnectionMap>,
    mcp: Arc<McpSupervisor>,
    bus: HubBus,
    listeners: Vec<ListenerHandle>,
    notifier: tokio::task::JoinHandle<()>,
}

impl Hub {
    /// Bind the three endpoints and start routing. MCP servers from the
    /// config are registered (not connected); the first tool call connects.
    pub async fn start(config: HubConfig) -> anyhow::Result<Self> {
        let bus = HubBus::default();
        let connections = Arc::new(ConnectionMap::new());
        let mcp = McpSupervisor::new(bus.clone());
        let router = Router::new(connections.clone(), mcp.clone(), bus.clone());

        for server in &config.mcp_servers {
            if let Err(e) = mcp.register(server.clone()).await {
                tracing::error!("Skipping MCP server '{}': {}", server.name, e);
            }
        }

        let handler: Arc<dyn FrameHandler> = router.clone();
        let mut listeners = Vec::with_capacity(3);
        for (kind, port) in [
            (PeerKind::Agent, config.port),
            (PeerKind::Client, config.client_port),
            (PeerKind::Service, config.service_port),
        ] {
            listeners.push(
                apiary_gateway::bind(kind, &config.host, port, connections.clone(), handler.clone())
                    .await?,
            );
        }

        let notifier = spawn_client_notifier(
            bus.subscribe(),
            router.clients().clone(),
            connections.clone(),
        );

        tracing::info!(
            "Hub ready: agents {}, clients {}, services {}",
            listeners[0].addr,
            listeners[1].addr,
            listeners[2].addr
        );

        Ok(Self {
            router,
            connections,
            mcp,
            bus,
            listeners,
            notifier,
        })
    }

    /// Bound address of one endpoint (useful with ephemeral ports).
    pub fn addr(&self, kind: PeerKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.kind == kind)
            .map(|l| l.addr)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn mcp(&self) -> &Arc<McpSupervisor> {
        &self.mcp
    }

    pub fn bus(&self) -> &HubBus {
        &self.bus
    }

    /// Stop accepting, fail every pending request with `Shutdown`, kill
    /// subprocesses, drop all connections.
    pub async fn stop(&self) {
        for listener in &self.listeners {
            listener.abort();
        }
        self.notifier.abort();
        self.connections.shutdown();
        self.mcp.shutdown_all().await;
        tracing::info!("Hub stopped");
    }
}

/// Fans agent lifecycle changes out to every connected client as
/// `system.notification` frames.
fn spawn_client_notifier(
    mut rx: broadcast::Receiver<HubEvent>,
    clients: Arc<ClientRegistry>,
    connections: Arc<ConnectionMap>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!("client notifier lagged, {} event(s) dropped", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let content = match &event {
                HubEvent::PeerRegistered {
                    kind: PeerKind::Agent,
                    id,
                    name,
                } => Some(json!({"event": "agent.online", "agentId": id, "agentName": name})),
                HubEvent::PeerReplaced {
                    kind: PeerKind::Agent,
                    id,
                    name,
                } => Some(json!({"event": "agent.replaced", "agentId": id, "agentName": name})),
                HubEvent::PeerDisconnected {
                    kind: PeerKind::Agent,
                    id: Some(id),
                    ..
                } => Some(json!({"event": "agent.offline", "agentId": id})),
                _ => None,
            };
            if let Some(content) = content {
                for connection_id in clients.online_connections().await {
                    let _ = connections
                        .send(&connection_id, Frame::new("system.notification", content.clone()));
                }
            }
        }
    })
}
