//! The three peer endpoints.
//!
//! Each endpoint is a WebSocket server: accept, mint a connection id, send
//! the welcome frame, then pump inbound frames to the router. Frames from
//! one connection are handled in receive order on its reader task.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use apiary_core::{Frame, HubError, PeerKind};

use crate::connection::{ConnectionHandle, ConnectionMap};
use crate::FrameHandler;

struct ListenerState {
    kind: PeerKind,
    connections: Arc<ConnectionMap>,
    handler: Arc<dyn FrameHandler>,
}

/// A bound endpoint. Aborting the handle stops accepting; existing
/// connections are torn down through [`ConnectionMap::shutdown`].
pub struct ListenerHandle {
    pub kind: PeerKind,
    pub addr: std::net::SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Bind one endpoint and start serving. Port 0 picks an ephemeral port;
/// the actual address is on the returned handle.
pub async fn bind(
    kind: PeerKind,
    host: &str,
    port: u16,
    connections: Arc<ConnectionMap>,
    handler: Arc<dyn FrameHandler>,
) -> anyhow::Result<ListenerHandle> {
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", host, port))
        .await
        .with_context(|| format!("Failed to bind {} endpoint on {}:{}", kind, host, port))?;
    let addr = listener.local_addr()?;

    let state = Arc::new(ListenerState {
        kind,
        connections,
        handler,
    });
    let app = Router::new()
        .route("/", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("{} endpoint server error: {}", kind, e);
        }
    });
    tracing::info!("{} endpoint listening on {}", kind, addr);

    Ok(ListenerHandle { kind, addr, task })
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ListenerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ListenerState>) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::debug!("{} connection accepted: {}", state.kind, connection_id);

    let (handle, mut outbound) = ConnectionHandle::new(connection_id.clone(), state.kind);
    state.connections.insert(handle);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: sole owner of the socket's write half.
    let writer_kind = state.kind;
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(frame.to_text())).await {
                tracing::debug!("{} socket write failed: {}", writer_kind, e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    if let Some(welcome) = state.handler.on_connect(state.kind, &connection_id).await {
        let _ = state.connections.send(&connection_id, welcome);
    }

    // Reader loop: this task owns frame ordering for the connection.
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match Frame::parse(&text) {
                Ok(frame) => {
                    state.connections.offer(&frame);
                    state
                        .handler
                        .on_frame(state.kind, &connection_id, frame)
                        .await;
                }
                Err(e) => {
                    // Malformed JSON: error frame back, no state change.
                    state.connections.send_error(
                        &connection_id,
                        &HubError::invalid(format!("malformed JSON: {}", e)),
                        None,
                        None,
                    );
                }
            },
            Message::Close(_) => break,
            // axum answers pings itself; binary frames are not part of
            // the protocol.
            _ => {}
        }
    }

    tracing::debug!("{} connection closed: {}", state.kind, connection_id);
    state.connections.remove(&connection_id);
    state
        .handler
        .on_disconnect(state.kind, &connection_id)
        .await;
    let _ = writer.await;
}
