//! Broadcast mode: every message goes to every other connected client.
//!
//! Broadcast clients live in their own [`ConnectionRegistry`], so they never
//! see pairing traffic and are never matched.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use metrics::counter;
use tandem_core::errors::PairingError;
use tandem_core::ids::ConnectionId;
use tandem_core::metrics::{BROADCAST_MESSAGES_TOTAL, PROTOCOL_ERRORS_TOTAL, RELAY_DROPS_TOTAL};
use tandem_core::protocol::{ClientCommand, ControlSignal, Envelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::registry::ConnectionRegistry;
use crate::session::SessionEnd;

/// Per-call delivery summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections other than the sender.
    pub recipients: usize,
    /// Copies enqueued.
    pub delivered: usize,
    /// Copies dropped on full or closing queues.
    pub dropped: usize,
}

/// Fans messages out across a broadcast registry.
#[derive(Debug)]
pub struct BroadcastHub {
    registry: Arc<ConnectionRegistry>,
    max_send_failures: u32,
}

impl BroadcastHub {
    /// Create a hub over its own registry.
    pub fn new(registry: Arc<ConnectionRegistry>, max_send_failures: u32) -> Self {
        Self {
            registry,
            max_send_failures,
        }
    }

    /// The broadcast registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a broadcast client and send it `welcome`.
    pub fn accept(&self, tx: &mpsc::Sender<Arc<String>>) -> Result<Arc<ClientConnection>, PairingError> {
        let connection = self
            .registry
            .admit(tx, self.max_send_failures, ConnectionId::new)?;
        info!(client_id = %connection.id, mode = "broadcast", "client connected");
        let _ = connection.send_signal(&ControlSignal::welcome(connection.id.clone()));
        Ok(connection)
    }

    /// Deliver `envelope`, tagged with `from`, to every other connection.
    /// Best effort per recipient.
    pub fn broadcast(&self, from: &ConnectionId, envelope: &Envelope) -> BroadcastReport {
        let wire = Arc::new(envelope.to_wire(from));
        let mut report = BroadcastReport::default();
        for connection in self.registry.connections() {
            if &connection.id == from {
                continue;
            }
            report.recipients += 1;
            if connection.send(wire.clone()) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }
        counter!(BROADCAST_MESSAGES_TOTAL).increment(1);
        if report.dropped > 0 {
            counter!(RELAY_DROPS_TOTAL).increment(report.dropped as u64);
            warn!(client_id = %from, dropped = report.dropped, "broadcast partially dropped");
        }
        debug!(
            client_id = %from,
            kind = envelope.kind(),
            recipients = report.recipients,
            "broadcast"
        );
        report
    }

    /// Drive a broadcast connection until its inbound stream ends, it is
    /// killed, or `shutdown` fires, then remove it.
    #[instrument(skip_all, fields(client_id = %connection.id))]
    pub async fn run<S, E>(&self, connection: Arc<ClientConnection>, inbound: S, shutdown: CancellationToken) -> SessionEnd
    where
        S: Stream<Item = Result<String, E>>,
        E: Display,
    {
        let id = connection.id.clone();
        let mut inbound = std::pin::pin!(inbound);

        let end = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break SessionEnd::Shutdown,
                () = connection.killed() => break SessionEnd::Killed,
                frame = inbound.next() => match frame {
                    Some(Ok(text)) => self.handle_inbound(&connection, &text),
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        break SessionEnd::TransportError;
                    }
                    None => break SessionEnd::ClientClosed,
                },
            }
        };

        if self.registry.remove(&id).is_some() {
            info!(reason = end.as_str(), mode = "broadcast", "client disconnected");
        }
        end
    }

    fn handle_inbound(&self, connection: &ClientConnection, text: &str) {
        match ClientCommand::parse(text) {
            Ok(ClientCommand::Relay(envelope)) => {
                let _ = self.broadcast(&connection.id, &envelope);
            }
            Ok(ClientCommand::KeepAlive) => connection.mark_alive(),
            Ok(ClientCommand::Swap) => {
                let _ = connection.send_signal(&ControlSignal::Error {
                    message: "swap is not available in broadcast mode".into(),
                });
            }
            Err(e) => {
                counter!(PROTOCOL_ERRORS_TOTAL).increment(1);
                warn!(client_id = %connection.id, error = %e, "malformed message dropped");
                let _ = connection.send_signal(&ControlSignal::Error {
                    message: e.to_string(),
                });
            }
        }
    }
}
