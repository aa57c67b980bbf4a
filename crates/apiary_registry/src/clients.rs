//! Client registry.
//!
//! Clients get an identity the moment their connection is accepted (the
//! welcome frame already carries the assigned id) and stay anonymous until
//! an explicit `client.register` supplies a name.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::peers::PeerStatus;
use apiary_core::{HubBus, HubEvent, PeerKind};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: PeerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, ClientRecord>,
    by_conn: HashMap<String, String>,
}

pub struct ClientRegistry {
    bus: HubBus,
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    pub fn new(bus: HubBus) -> Self {
        Self {
            bus,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Accept a connection: mint an anonymous client record immediately.
    pub async fn connect(&self, connection_id: &str) -> ClientRecord {
        let now = Utc::now();
        let record = ClientRecord {
            id: Uuid::new_v4().to_string(),
            name: None,
            status: PeerStatus::Online,
            connection_id: Some(connection_id.to_string()),
            registered_at: now,
            last_active_at: now,
            metadata: Value::Null,
        };
        let mut inner = self.inner.write().await;
        inner
            .by_conn
            .insert(connection_id.to_string(), record.id.clone());
        inner.records.insert(record.id.clone(), record.clone());
        drop(inner);

        self.bus.publish(HubEvent::PeerConnected {
            kind: PeerKind::Client,
            connection_id: connection_id.to_string(),
        });
        record
    }

    /// Upsert name/metadata for the client on this connection.
    pub async fn register(
        &self,
        connection_id: &str,
        name: Option<String>,
        metadata: Value,
    ) -> Option<ClientRecord> {
        let mut inner = self.inner.write().await;
        let id = inner.by_conn.get(connection_id)?.clone();
        let record = inner.records.get_mut(&id)?;
        if name.is_some() {
            record.name = name;
        }
        if !metadata.is_null() {
            record.metadata = metadata;
        }
        record.status = PeerStatus::Online;
        record.last_active_at = Utc::now();
        let record = record.clone();
        drop(inner);

        self.bus.publish(HubEvent::PeerRegistered {
            kind: PeerKind::Client,
            id: record.id.clone(),
            name: record.name.clone().unwrap_or_default(),
        });
        Some(record)
    }

    /// Refresh `last_active_at` on any inbound frame.
    pub async fn touch(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.by_conn.get(connection_id).cloned() {
            if let Some(record) = inner.records.get_mut(&id) {
                record.last_active_at = Utc::now();
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<ClientRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn get_by_connection(&self, connection_id: &str) -> Option<ClientRecord> {
        let inner = self.inner.read().await;
        let id = inner.by_conn.get(connection_id)?;
        inner.records.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<ClientRecord> {
        self.inner.read().await.records.values().cloned().collect()
    }

    /// Connection id for an online client, if any.
    pub async fn connection_for(&self, client_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .records
            .get(client_id)?
            .connection_id
            .clone()
    }

    /// All currently connected clients' connection ids (notification fan-out).
    pub async fn online_connections(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .records
            .values()
            .filter_map(|r| r.connection_id.clone())
            .collect()
    }

    pub async fn handle_disconnect(&self, connection_id: &str) -> Option<ClientRecord> {
        let mut inner = self.inner.write().await;
        let id = inner.by_conn.remove(connection_id);
        let record = id.as_ref().and_then(|id| {
            let record = inner.records.get_mut(id)?;
            record.status = PeerStatus::Offline;
            record.connection_id = None;
            Some(record.clone())
        });
        drop(inner);

        self.bus.publish(HubEvent::PeerDisconnected {
            kind: PeerKind::Client,
            id: record.as_ref().map(|r| r.id.clone()),
            connection_id: connection_id.to_string(),
        });
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(HubBus::new(64))
    }

    #[tokio::test]
    async fn test_connect_creates_anonymous_record() {
        let reg = registry();
        let record = reg.connect("c1").await;
        assert!(record.name.is_none());
        assert_eq!(record.status, PeerStatus::Online);
        assert_eq!(reg.get_by_connection("c1").await.unwrap().id, record.id);
    }

    #[tokio::test]
    async fn test_register_upserts_name_and_metadata() {
        let reg = registry();
        let record = reg.connect("c1").await;
        let updated = reg
            .register("c1", Some("ui".into()), json!({"version": "2.0"}))
            .await
            .unwrap();
        assert_eq!(updated.id, record.id);
        assert_eq!(updated.name.as_deref(), Some("ui"));
        assert_eq!(updated.metadata["version"], "2.0");

        // Re-register without a name keeps the old one.
        let again = reg.register("c1", None, Value::Null).await.unwrap();
        assert_eq!(again.name.as_deref(), Some("ui"));
    }

    #[tokio::test]
    async fn test_disconnect_marks_offline_and_retains() {
        let reg = registry();
        let record = reg.connect("c1").await;
        let affected = reg.handle_disconnect("c1").await.unwrap();
        assert_eq!(affected.id, record.id);
        assert_eq!(reg.get(&record.id).await.unwrap().status, PeerStatus::Offline);
        assert!(reg.connection_for(&record.id).await.is_none());
        assert!(reg.online_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_touch_moves_last_active() {
        let reg = registry();
        let before = reg.connect("c1").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        reg.touch("c1").await;
        let after = reg.get(&before.id).await.unwrap();
        assert!(after.last_active_at > before.last_active_at);
    }
}
