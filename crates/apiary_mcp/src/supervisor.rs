//! MCP subprocess supervisor.
//!
//! Owns the server records and at most one live [`StdioConnection`] per
//! server. Connect performs the `initialize` handshake and caches the tool
//! set; tool execution lazy-connects. A dead subprocess never takes the hub
//! down: the record drops back to `registered` and the next call reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use apiary_core::{HubBus, HubError, HubEvent, McpServerConfig};

use crate::stdio::StdioConnection;
use crate::types::{
    McpServerRecord, McpServerStatus, McpTool, StdioRequest, StdioResponse, ToolCallSpec,
    ToolOutcome, MCP_PROTOCOL_VERSION,
};

/// Deadline for the `initialize` handshake and tool discovery.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for a tool call.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Inner {
    servers: HashMap<String, McpServerRecord>,
    connections: HashMap<String, Arc<StdioConnection>>,
    tools: HashMap<String, Vec<McpTool>>,
}

pub struct McpSupervisor {
    bus: HubBus,
    inner: RwLock<Inner>,
    exit_tx: mpsc::UnboundedSender<String>,
}

impl McpSupervisor {
    pub fn new(bus: HubBus) -> Arc<Self> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<String>();
        let supervisor = Arc::new(Self {
            bus,
            inner: RwLock::new(Inner::default()),
            exit_tx,
        });

        // Subprocess deaths arrive here from each connection's exit watcher.
        let weak = Arc::downgrade(&supervisor);
        tokio::spawn(async move {
            while let Some(server_id) = exit_rx.recv().await {
                let Some(supervisor) = weak.upgrade() else { break };
                supervisor.handle_exit(&server_id).await;
            }
        });

        supervisor
    }

    /// Upsert a server record. Validates `name && (path || command)`.
    /// Idempotent; a connected server stays online.
    pub async fn register(&self, config: McpServerConfig) -> Result<McpServerRecord, HubError> {
        if config.name.is_empty() {
            return Err(HubError::invalid("MCP server requires a name"));
        }
        if config.path.is_none() && config.command.is_none() {
            return Err(HubError::invalid(format!(
                "MCP server '{}' requires a path or command",
                config.name
            )));
        }
        let id = config
            .id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut inner = self.inner.write().await;
        let record = match inner.servers.get_mut(&id) {
            Some(existing) => {
                existing.name = config.name;
                existing.server_type = config.server_type;
                existing.path = config.path;
                existing.command = config.command;
                existing.args = config.args;
                existing.env = config.env;
                existing.metadata = config.metadata.unwrap_or(Value::Null);
                existing.updated_at = Some(Utc::now());
                existing.clone()
            }
            None => {
                let record = McpServerRecord {
                    id: id.clone(),
                    name: config.name,
                    server_type: config.server_type,
                    path: config.path,
                    command: config.command,
                    args: config.args,
                    env: config.env,
                    capabilities: vec![],
                    status: McpServerStatus::Registered,
                    connection_id: None,
                    metadata: config.metadata.unwrap_or(Value::Null),
                    registered_at: Utc::now(),
                    updated_at: None,
                };
                inner.servers.insert(id.clone(), record.clone());
                record
            }
        };
        drop(inner);

        tracing::info!("MCP server '{}' registered ({})", record.name, record.id);
        Ok(record)
    }

    pub async fn get_server(&self, server_id: &str) -> Option<McpServerRecord> {
        self.inner.read().await.servers.get(server_id).cloned()
    }

    /// Resolve by id first, then by name.
    pub async fn resolve(&self, key: &str) -> Option<McpServerRecord> {
        let inner = self.inner.read().await;
        if let Some(record) = inner.servers.get(key) {
            return Some(record.clone());
        }
        inner.servers.values().find(|s| s.name == key).cloned()
    }

    pub async fn list_servers(&self) -> Vec<McpServerRecord> {
        self.inner.read().await.servers.values().cloned().collect()
    }

    /// Spawn the subprocess, run the handshake, discover tools.
    pub async fn connect(&self, server_id: &str) -> Result<Vec<McpTool>, HubError> {
        let record = self
            .get_server(server_id)
            .await
            .ok_or_else(|| HubError::not_found("MCP server", server_id))?;

        // A live connection is torn down before relaunching.
        let existing = self.inner.write().await.connections.remove(server_id);
        if let Some(conn) = existing {
            conn.shutdown().await;
        }

        let connection = match StdioConnection::spawn(&record, self.exit_tx.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                self.mark_error(server_id, &e).await;
                return Err(e);
            }
        };

        let handshake = async {
            let init = connection
                .request(
                    StdioRequest::Initialize {
                        version: MCP_PROTOCOL_VERSION.to_string(),
                    },
                    CONNECT_TIMEOUT,
                )
                .await?;
            if let Some(error) = init.error {
                return Err(HubError::unavailable(format!(
                    "MCP server '{}' rejected initialize: {}",
                    record.name, error
                )));
            }
            let listed: StdioResponse = connection
                .request(StdioRequest::ListTools, CONNECT_TIMEOUT)
                .await?;
            Ok::<Vec<McpTool>, HubError>(listed.tools.unwrap_or_default())
        };

        let tools = match handshake.await {
            Ok(tools) => tools,
            Err(e) => {
                connection.kill();
                self.mark_error(server_id, &e).await;
                return Err(e);
            }
        };

        let mut inner = self.inner.write().await;
        if let Some(server) = inner.servers.get_mut(server_id) {
            server.status = McpServerStatus::Online;
            server.connection_id = Some(connection.id.clone());
            server.capabilities = tools.iter().map(|t| t.name.clone()).collect();
            server.updated_at = Some(Utc::now());
        }
        inner
            .connections
            .insert(server_id.to_string(), connection);
        inner.tools.insert(server_id.to_string(), tools.clone());
        drop(inner);

        self.bus.publish(HubEvent::McpServerStatus {
            server_id: server_id.to_string(),
            status: McpServerStatus::Online.as_str().to_string(),
        });
        tracing::info!(
            "MCP server '{}' online with {} tool(s)",
            record.name,
            tools.len()
        );
        Ok(tools)
    }

    /// Cached tool set, connecting first if needed.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<McpTool>, HubError> {
        self.ensure_connected(server_id).await?;
        Ok(self
            .inner
            .read()
            .await
            .tools
            .get(server_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Execute a tool, lazy-connecting. Tool-reported errors come back in
    /// the outcome payload, not as a transport failure.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolOutcome, HubError> {
        self.ensure_connected(server_id).await?;
        let connection = self
            .inner
            .read()
            .await
            .connections
            .get(server_id)
            .cloned()
            .ok_or_else(|| HubError::unavailable(format!("MCP server {} not connected", server_id)))?;

        let response = connection
            .request(
                StdioRequest::ToolCall {
                    tool: ToolCallSpec {
                        name: tool_name.to_string(),
                        args,
                    },
                },
                timeout.unwrap_or(TOOL_CALL_TIMEOUT),
            )
            .await?;

        Ok(ToolOutcome {
            result: response.result,
            metadata: response.metadata,
            error: response.error,
        })
    }

    /// Best-effort shutdown dialog, then kill; record back to `registered`.
    pub async fn disconnect(&self, server_id: &str) -> Result<(), HubError> {
        let connection = self.inner.write().await.connections.remove(server_id);
        match connection {
            Some(conn) => {
                conn.shutdown().await;
                self.mark_registered(server_id).await;
                Ok(())
            }
            None => Err(HubError::not_found("MCP connection", server_id)),
        }
    }

    /// Hub stop: kill everything, no shutdown ceremony.
    pub async fn shutdown_all(&self) {
        let connections: Vec<Arc<StdioConnection>> = {
            let mut inner = self.inner.write().await;
            inner.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.kill();
        }
        let mut inner = self.inner.write().await;
        for server in inner.servers.values_mut() {
            if server.status == McpServerStatus::Online {
                server.status = McpServerStatus::Registered;
                server.connection_id = None;
            }
        }
    }

    async fn ensure_connected(&self, server_id: &str) -> Result<(), HubError> {
        let alive = {
            let inner = self.inner.read().await;
            let connected = inner
                .connections
                .get(server_id)
                .map(|c| !c.is_closed())
                .unwrap_or(false);
            connected
                && inner
                    .servers
                    .get(server_id)
                    .map(|s| s.status == McpServerStatus::Online)
                    .unwrap_or(false)
        };
        if alive {
            return Ok(());
        }
        self.connect(server_id).await.map(|_| ())
    }

    async fn mark_error(&self, server_id: &str, error: &HubError) {
        tracing::error!("MCP server {} failed: {}", server_id, error);
        let mut inner = self.inner.write().await;
        if let Some(server) = inner.servers.get_mut(server_id) {
            server.status = McpServerStatus::Error;
            server.connection_id = None;
            server.updated_at = Some(Utc::now());
        }
        drop(inner);
        self.bus.publish(HubEvent::McpServerStatus {
            server_id: server_id.to_string(),
            status: McpServerStatus::Error.as_str().to_string(),
        });
    }

    async fn mark_registered(&self, server_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(server) = inner.servers.get_mut(server_id) {
            server.status = McpServerStatus::Registered;
            server.connection_id = None;
            server.updated_at = Some(Utc::now());
        }
        drop(inner);
        self.bus.publish(HubEvent::McpServerStatus {
            server_id: server_id.to_string(),
            status: McpServerStatus::Registered.as_str().to_string(),
        });
    }

    /// A subprocess died on its own: drop the connection, fail nothing
    /// further (pending requests were failed by the exit watcher), and
    /// make the server reconnectable. Exit events for a connection that
    /// was already replaced must not touch its successor.
    async fn handle_exit(&self, server_id: &str) {
        let mut inner = self.inner.write().await;
        let dead = inner
            .connections
            .get(server_id)
            .map(|c| c.is_closed())
            .unwrap_or(false);
        if !dead {
            return;
        }
        inner.connections.remove(server_id);
        drop(inner);
        self.mark_registered(server_id).await;
    }
}
