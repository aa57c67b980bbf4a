//! Live connection tracking and the send-and-await primitive.
//!
//! The write side of every socket is single-writer: frames queue on a
//! per-connection channel drained by the socket's writer task. The router
//! never touches a transport directly; it goes through [`ConnectionMap`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::mpsc;

use apiary_core::{Correlator, Frame, HubError, PeerKind};

/// Outbound queue depth per connection. Writes are non-blocking at the
/// hub's API; a full queue counts as a failed transport write.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub kind: PeerKind,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(id: String, kind: PeerKind) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (Self { id, kind, tx }, rx)
    }
}

/// All live connections across the three endpoints, plus the pending-request
/// table replies resolve against.
pub struct ConnectionMap {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    correlator: Correlator<Frame>,
}

impl Default for ConnectionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            correlator: Correlator::new(),
        }
    }

    pub fn insert(&self, handle: ConnectionHandle) {
        self.connections
            .write()
            .unwrap()
            .insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, connection_id: &str) {
        self.connections.write().unwrap().remove(connection_id);
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().unwrap().contains_key(connection_id)
    }

    /// Queue a frame for a connection's writer task.
    pub fn send(&self, connection_id: &str, frame: Frame) -> Result<(), HubError> {
        let tx = {
            let connections = self.connections.read().unwrap();
            let handle = connections.get(connection_id).ok_or_else(|| {
                HubError::unavailable(format!("connection {} not found", connection_id))
            })?;
            handle.tx.clone()
        };
        tx.try_send(frame).map_err(|e| {
            tracing::warn!("Dropping frame for {}: {}", connection_id, e);
            HubError::unavailable(format!("transport write failed for {}", connection_id))
        })
    }

    /// Emit a wire `error` frame to a connection. Best-effort.
    pub fn send_error(
        &self,
        connection_id: &str,
        error: &HubError,
        request_id: Option<String>,
        details: Option<serde_json::Value>,
    ) {
        if let Err(e) = self.send(connection_id, error.to_frame(request_id, details)) {
            tracing::debug!("Could not deliver error frame to {}: {}", connection_id, e);
        }
    }

    /// Send-and-await: emit `frame` on `connection_id` and wait for the
    /// first inbound frame whose `requestId` matches `frame.id` (and passes
    /// `filter`, when supplied). Fails with `Timeout` past the deadline and
    /// `Shutdown` when the hub stops.
    pub async fn request(
        &self,
        connection_id: &str,
        frame: Frame,
        timeout: Duration,
        filter: Option<Box<dyn Fn(&Frame) -> bool + Send + Sync>>,
    ) -> Result<Frame, HubError> {
        let id = frame.id.clone();
        let kind = frame.kind.clone();
        let rx = self.correlator.register(id.clone(), filter);
        if let Err(e) = self.send(connection_id, frame) {
            self.correlator.remove(&id);
            return Err(e);
        }
        self.correlator.await_reply(&id, rx, &kind, timeout).await
    }

    /// Offer an inbound frame to the pending-request table. The frame is
    /// not consumed: replies still flow through normal routing.
    pub fn offer(&self, frame: &Frame) -> bool {
        match &frame.request_id {
            Some(request_id) => self.correlator.resolve(request_id, frame),
            None => false,
        }
    }

    /// Fail every outstanding request and drop all write handles; writer
    /// tasks drain and close their sockets.
    pub fn shutdown(&self) {
        self.correlator.fail_all();
        self.connections.write().unwrap().clear();
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_to_unknown_connection_is_unavailable() {
        let map = ConnectionMap::new();
        let err = map.send("nope", Frame::new("ping", json!({}))).unwrap_err();
        assert!(matches!(err, HubError::UnavailablePeer { .. }));
    }

    #[tokio::test]
    async fn test_request_roundtrip_with_offer() {
        let map = std::sync::Arc::new(ConnectionMap::new());
        let (handle, mut rx) = ConnectionHandle::new("c1".into(), PeerKind::Agent);
        map.insert(handle);

        let peer_map = map.clone();
        tokio::spawn(async move {
            let sent = rx.recv().await.unwrap();
            let reply = Frame::reply(&sent, "pong", json!({"timestamp": "t"}));
            assert!(peer_map.offer(&reply));
        });

        let reply = map
            .request(
                "c1",
                Frame::new("ping", json!({})),
                Duration::from_secs(1),
                Some(Box::new(|f: &Frame| f.kind == "pong")),
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, "pong");
        assert_eq!(map.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let map = ConnectionMap::new();
        let (handle, _rx) = ConnectionHandle::new("c1".into(), PeerKind::Agent);
        map.insert(handle);

        let err = map
            .request(
                "c1",
                Frame::new("task.execute", json!({})),
                Duration::from_millis(20),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout { .. }));
        assert_eq!(map.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending() {
        let map = std::sync::Arc::new(ConnectionMap::new());
        let (handle, _rx) = ConnectionHandle::new("c1".into(), PeerKind::Agent);
        map.insert(handle);

        let waiter = {
            let map = map.clone();
            tokio::spawn(async move {
                map.request(
                    "c1",
                    Frame::new("task.execute", json!({})),
                    Duration::from_secs(5),
                    None,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        map.shutdown();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, HubError::Shutdown);
    }

    #[tokio::test]
    async fn test_offer_without_request_id_is_ignored() {
        let map = ConnectionMap::new();
        assert!(!map.offer(&Frame::new("task.result", json!({}))));
    }
}
