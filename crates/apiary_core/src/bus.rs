//! In-process event fan-out between hub components.
//!
//! Typed events over a broadcast channel. Delivery is best-effort: no
//! durability, lagging subscribers lose events. This is glue between
//! listeners, router, and the MCP supervisor, never a cross-connection
//! channel.

use tokio::sync::broadcast;

use crate::PeerKind;

#[derive(Debug, Clone)]
pub enum HubEvent {
    PeerConnected {
        kind: PeerKind,
        connection_id: String,
    },
    PeerRegistered {
        kind: PeerKind,
        id: String,
        name: String,
    },
    /// An older identity was evicted by a same-name registration.
    PeerReplaced {
        kind: PeerKind,
        id: String,
        name: String,
    },
    PeerDisconnected {
        kind: PeerKind,
        id: Option<String>,
        connection_id: String,
    },
    TaskCreated {
        task_id: String,
        agent_id: String,
    },
    TaskUpdated {
        task_id: String,
        from: String,
        to: String,
    },
    McpServerStatus {
        server_id: String,
        status: String,
    },
}

/// Cloneable handle to the hub's event channel.
#[derive(Debug, Clone)]
pub struct HubBus {
    tx: broadcast::Sender<HubEvent>,
}

impl Default for HubBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl HubBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A send with no subscribers is not an error.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = HubBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(HubEvent::PeerConnected {
            kind: PeerKind::Agent,
            connection_id: "c1".into(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                HubEvent::PeerConnected { connection_id, .. } => {
                    assert_eq!(connection_id, "c1");
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = HubBus::new(4);
        bus.publish(HubEvent::TaskUpdated {
            task_id: "t".into(),
            from: "pending".into(),
            to: "in_progress".into(),
        });
    }
}
