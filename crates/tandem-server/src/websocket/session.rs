//! Pairing-mode socket lifecycle, from upgrade through disconnect.

use axum::extract::ws::WebSocket;
use tokio::sync::mpsc;
use tracing::instrument;

use super::{drive, refuse};
use crate::server::AppState;

/// Run a pairing-mode WebSocket.
///
/// 1. Registers the client (it receives `welcome`, then `partner-found` or `waiting`)
/// 2. Spawns the writer and heartbeat
/// 3. Drives the pairing state machine until close, kill, or shutdown
/// 4. Removes the client, notifying and re-matching its partner
#[instrument(skip_all, fields(mode = "pairing"))]
pub async fn run_pairing_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = mpsc::channel(state.config.send_queue_capacity.max(1));
    let connection = match state.controller.accept(&tx) {
        Ok(connection) => connection,
        Err(e) => return refuse(socket, "pairing", &e).await,
    };
    drop(tx);

    let controller = state.controller.clone();
    let shutdown = state.shutdown.token();
    let handle = connection.clone();
    let _ = drive(socket, handle, rx, &state.config, "pairing", move |inbound| async move {
        controller.run(connection, inbound, shutdown).await
    })
    .await;
}
