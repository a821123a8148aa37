//! WebSocket transport for both endpoints.
//!
//! Each upgraded socket is split into:
//! - an inbound frame stream consumed by the session driver
//! - a writer task draining the connection's outbound queue and sending pings
//! - a heartbeat task that kills the connection when pongs stop

pub mod broadcast;
pub mod heartbeat;
pub mod session;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::{BoxStream, SplitSink};
use futures::{SinkExt, StreamExt, future};
use metrics::{counter, histogram};
use tandem_core::metrics::{
    CONNECTIONS_KILLED_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_REJECTED_TOTAL,
};
use tandem_core::{ControlSignal, PairingError};
use tandem_pairing::{ClientConnection, SessionEnd};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use heartbeat::{HeartbeatResult, run_heartbeat};

/// Inbound text frames, already filtered of control frames.
pub type InboundFrames = BoxStream<'static, Result<String, axum::Error>>;

/// Turn the read half of a socket into text frames.
///
/// Binary frames are accepted when they are UTF-8. Ping, pong and text
/// frames mark the connection alive. A close frame ends the stream.
fn inbound_frames(
    stream: futures::stream::SplitStream<WebSocket>,
    connection: Arc<ClientConnection>,
) -> InboundFrames {
    stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(move |msg| {
            let connection = connection.clone();
            async move {
                match msg {
                    Ok(Message::Text(text)) => {
                        connection.mark_alive();
                        Some(Ok(text.as_str().to_owned()))
                    }
                    Ok(Message::Binary(data)) => {
                        connection.mark_alive();
                        if let Ok(text) = std::str::from_utf8(&data) {
                            Some(Ok(text.to_owned()))
                        } else {
                            debug!(client_id = %connection.id, len = data.len(), "non-UTF-8 binary frame");
                            let _ = connection.send_signal(&ControlSignal::Error {
                                message: "binary frames must be UTF-8 JSON".into(),
                            });
                            None
                        }
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => {
                        connection.mark_alive();
                        None
                    }
                    Ok(Message::Close(_)) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        })
        .boxed()
}

/// Drain `outbound` into the socket, pinging every `ping_interval`, until
/// the queue closes, the socket fails, or `done` fires. On `done` the
/// frames still queued are flushed before the close frame.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<String>>,
    ping_interval: Duration,
    done: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_interval);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(text) = msg else { break };
                if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
            () = done.cancelled() => {
                while let Ok(text) = outbound.try_recv() {
                    if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))
        .await;
}

/// Run one accepted connection to completion.
///
/// Spawns the writer and heartbeat, hands the inbound frames to `session`,
/// and records connection metrics around it.
pub(crate) async fn drive<F, Fut>(
    socket: WebSocket,
    connection: Arc<ClientConnection>,
    outbound: mpsc::Receiver<Arc<String>>,
    config: &ServerConfig,
    mode: &'static str,
    session: F,
) -> SessionEnd
where
    F: FnOnce(InboundFrames) -> Fut,
    Fut: Future<Output = SessionEnd>,
{
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL, "mode" => mode).increment(1);

    let (sink, stream) = socket.split();
    let done = CancellationToken::new();
    let writer = tokio::spawn(write_loop(sink, outbound, config.heartbeat_interval(), done.clone()));
    let heartbeat = {
        let connection = connection.clone();
        let interval = config.heartbeat_interval();
        let timeout = config.heartbeat_timeout();
        let done = done.clone();
        tokio::spawn(async move {
            if run_heartbeat(connection.clone(), interval, timeout, done).await == HeartbeatResult::TimedOut {
                warn!(client_id = %connection.id, ?timeout, "client unresponsive, disconnecting");
                counter!(CONNECTIONS_KILLED_TOTAL, "reason" => "heartbeat").increment(1);
                connection.kill();
            }
        })
    };

    let end = session(inbound_frames(stream, connection.clone())).await;

    info!(client_id = %connection.id, mode, reason = end.as_str(), "connection closed");
    counter!(WS_DISCONNECTIONS_TOTAL, "mode" => mode, "reason" => end.as_str()).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS, "mode" => mode).record(started.elapsed().as_secs_f64());

    done.cancel();
    let _ = heartbeat.await;
    drop(connection);
    let _ = writer.await;
    end
}

/// Close a socket whose connection could not be registered.
pub(crate) async fn refuse(socket: WebSocket, mode: &'static str, err: &PairingError) {
    warn!(mode, error = %err, "connection refused");
    counter!(WS_REJECTED_TOTAL, "reason" => "registry").increment(1);
    let (mut sink, _) = socket.split();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: err.to_string().into(),
        })))
        .await;
}
