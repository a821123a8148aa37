//! Broadcast-mode socket lifecycle.

use axum::extract::ws::WebSocket;
use tokio::sync::mpsc;
use tracing::instrument;

use super::{drive, refuse};
use crate::server::AppState;

/// Run a broadcast-mode WebSocket: every valid message from this client is
/// delivered to every other broadcast client, tagged with its `sender_id`.
#[instrument(skip_all, fields(mode = "broadcast"))]
pub async fn run_broadcast_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = mpsc::channel(state.config.send_queue_capacity.max(1));
    let connection = match state.broadcast.accept(&tx) {
        Ok(connection) => connection,
        Err(e) => return refuse(socket, "broadcast", &e).await,
    };
    drop(tx);

    let hub = state.broadcast.clone();
    let shutdown = state.shutdown.token();
    let handle = connection.clone();
    let _ = drive(socket, handle, rx, &state.config, "broadcast", move |inbound| async move {
        hub.run(connection, inbound, shutdown).await
    })
    .await;
}
