pub mod connection;
pub mod listener;

pub use connection::{ConnectionHandle, ConnectionMap};
pub use listener::{bind, ListenerHandle};

use apiary_core::{Frame, PeerKind};
use async_trait::async_trait;

/// The seam between the listeners and the router. One implementation (the
/// router) serves all three endpoints; `kind` says which one a callback
/// came from.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// A connection was accepted. The returned frame, if any, is the
    /// welcome sent before anything else.
    async fn on_connect(&self, kind: PeerKind, connection_id: &str) -> Option<Frame>;

    /// One decoded frame, in receive order for its connection.
    async fn on_frame(&self, kind: PeerKind, connection_id: &str, frame: Frame);

    /// Transport closed (peer hangup or write failure).
    async fn on_disconnect(&self, kind: PeerKind, connection_id: &str);
}
