//! Identity registry shared by the agent and service endpoints.
//!
//! Three disjoint maps guarded by one lock: pending connections (by
//! connection id), registered records (indexed by identity id and by name),
//! and a reverse index connection id → identity id. Records survive
//! disconnects so a peer can reclaim its identity on reconnect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use apiary_core::{HubBus, HubError, HubEvent, PeerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// A registered agent or service identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: PeerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_details: Option<Value>,
    pub registered_at: DateTime<Utc>,
}

/// A connection that said hello but has not registered yet.
#[derive(Debug, Clone)]
pub struct PendingConnection {
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, PendingConnection>,
    records: HashMap<String, PeerRecord>,
    by_name: HashMap<String, String>,
    by_conn: HashMap<String, String>,
}

/// Registry for one peer kind (agents or services).
pub struct PeerRegistry {
    kind: PeerKind,
    bus: HubBus,
    inner: RwLock<Inner>,
}

impl PeerRegistry {
    pub fn new(kind: PeerKind, bus: HubBus) -> Self {
        Self {
            kind,
            bus,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Track a freshly accepted connection.
    pub async fn add_pending(&self, connection_id: &str) {
        let mut inner = self.inner.write().await;
        inner.pending.insert(
            connection_id.to_string(),
            PendingConnection {
                connection_id: connection_id.to_string(),
                connected_at: Utc::now(),
            },
        );
        drop(inner);
        self.bus.publish(HubEvent::PeerConnected {
            kind: self.kind,
            connection_id: connection_id.to_string(),
        });
    }

    /// Promote a pending connection to a registered identity.
    ///
    /// Same id on a new connection reclaims the record; same name under a
    /// different id evicts the older record (retained offline with a
    /// "replaced" reason). Duplicate name with the same id is idempotent.
    pub async fn register(
        &self,
        connection_id: &str,
        id: Option<String>,
        name: String,
        capabilities: Vec<String>,
    ) -> Result<PeerRecord, HubError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        if inner.pending.remove(connection_id).is_none()
            && !inner.by_conn.contains_key(connection_id)
        {
            return Err(HubError::UnknownConnection {
                connection_id: connection_id.to_string(),
            });
        }

        let id = id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut replaced: Option<PeerRecord> = None;

        // Same name held by a distinct id: the newer registration wins.
        if let Some(holder) = inner.by_name.get(&name).cloned() {
            if holder != id {
                if let Some(old) = inner.records.get_mut(&holder) {
                    old.status = PeerStatus::Offline;
                    old.status_details = Some(json!({
                        "disconnectedReason":
                            format!("Replaced by {} with same name", self.kind),
                    }));
                    let stale_conn = old.connection_id.take();
                    replaced = Some(old.clone());
                    if let Some(conn) = stale_conn {
                        inner.by_conn.remove(&conn);
                    }
                }
                inner.by_name.remove(&name);
            }
        }

        if let Some(existing) = inner.records.get_mut(&id) {
            // Same id reconnecting from elsewhere: drop the stale association.
            let stale_conn = existing
                .connection_id
                .take()
                .filter(|c| c != connection_id);
            let old_name = (existing.name != name).then(|| existing.name.clone());
            existing.name = name.clone();
            existing.capabilities = capabilities;
            existing.status = PeerStatus::Online;
            existing.status_details = None;
            existing.connection_id = Some(connection_id.to_string());
            if let Some(conn) = stale_conn {
                inner.by_conn.remove(&conn);
            }
            if let Some(old_name) = old_name {
                inner.by_name.remove(&old_name);
            }
        } else {
            inner.records.insert(
                id.clone(),
                PeerRecord {
                    id: id.clone(),
                    name: name.clone(),
                    capabilities,
                    status: PeerStatus::Online,
                    connection_id: Some(connection_id.to_string()),
                    status_details: None,
                    registered_at: Utc::now(),
                },
            );
        }
        inner.by_name.insert(name.clone(), id.clone());
        inner.by_conn.insert(connection_id.to_string(), id.clone());
        let record = inner.records.get(&id).cloned().unwrap();
        drop(guard);

        if let Some(old) = replaced {
            tracing::info!(
                "{} '{}' replaced older registration {}",
                self.kind,
                name,
                old.id
            );
            self.bus.publish(HubEvent::PeerReplaced {
                kind: self.kind,
                id: old.id,
                name: old.name,
            });
        }
        self.bus.publish(HubEvent::PeerRegistered {
            kind: self.kind,
            id: record.id.clone(),
            name: record.name.clone(),
        });
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Option<PeerRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<PeerRecord> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(name)?;
        inner.records.get(id).cloned()
    }

    pub async fn get_by_connection(&self, connection_id: &str) -> Option<PeerRecord> {
        let inner = self.inner.read().await;
        let id = inner.by_conn.get(connection_id)?;
        inner.records.get(id).cloned()
    }

    /// Resolve by id first, then by name.
    pub async fn resolve(&self, id: Option<&str>, name: Option<&str>) -> Option<PeerRecord> {
        if let Some(id) = id {
            if let Some(record) = self.get(id).await {
                return Some(record);
            }
        }
        if let Some(name) = name {
            return self.get_by_name(name).await;
        }
        None
    }

    /// Snapshot filtered by status and required capabilities.
    pub async fn list(
        &self,
        status: Option<&str>,
        capabilities: Option<&[String]>,
    ) -> Vec<PeerRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .values()
            .filter(|r| match status {
                Some(s) => r.status.as_str() == s,
                None => true,
            })
            .filter(|r| match capabilities {
                Some(caps) => caps.iter().all(|c| r.capabilities.contains(c)),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Merge self-reported state into `status_details`. The online/offline
    /// lifecycle status is owned by register/disconnect, never by the peer:
    /// the conn→identity index must track it exactly.
    pub async fn update_status(
        &self,
        connection_id: &str,
        status: Option<&str>,
        details: Option<Value>,
    ) -> Result<PeerRecord, HubError> {
        let mut inner = self.inner.write().await;
        let id = inner
            .by_conn
            .get(connection_id)
            .cloned()
            .ok_or_else(|| HubError::unknown_identity(format!("{} not registered", self.kind)))?;
        let record = inner.records.get_mut(&id).unwrap();
        let mut merged = match record.status_details.take() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        if let Some(state) = status {
            merged.insert("state".to_string(), json!(state));
        }
        if let Some(Value::Object(extra)) = details {
            merged.extend(extra);
        }
        if !merged.is_empty() {
            record.status_details = Some(Value::Object(merged));
        }
        Ok(record.clone())
    }

    /// Transport closed: flip the record offline but retain it so the peer
    /// can reclaim its identity later. Returns the affected record, if the
    /// connection had registered.
    pub async fn handle_disconnect(&self, connection_id: &str) -> Option<PeerRecord> {
        let mut inner = self.inner.write().await;
        inner.pending.remove(connection_id);
        let id = inner.by_conn.remove(connection_id);
        let record = id.as_ref().and_then(|id| {
            let record = inner.records.get_mut(id)?;
            record.status = PeerStatus::Offline;
            record.connection_id = None;
            Some(record.clone())
        });
        drop(inner);

        self.bus.publish(HubEvent::PeerDisconnected {
            kind: self.kind,
            id: record.as_ref().map(|r| r.id.clone()),
            connection_id: connection_id.to_string(),
        });
        record
    }

    /// Hard delete.
    pub async fn remove(&self, id: &str) -> Option<PeerRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.records.remove(id)?;
        inner.by_name.remove(&record.name);
        if let Some(conn) = &record.connection_id {
            inner.by_conn.remove(conn);
        }
        Some(record)
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending.len()
    }
}
