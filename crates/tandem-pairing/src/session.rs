//! Per-connection pairing state machine.
//!
//! ```text
//!             accept
//!               │
//!               ▼
//!   ┌──────► SEARCHING ──── partner found ───► PAIRED ──┐
//!   │           │ ▲                              │      │ message → relay
//!   │           │ └── swap / partner left ───────┘ ◄────┘
//!   │           │
//!   └─ swap ────┘          any ── disconnect ──► CLOSED
//! ```
//!
//! Every transition that changes pairing state and the control signals it
//! emits happen under one transition lock, so a client always sees
//! `partner-changed` / `partner-disconnected` before the `partner-found` of
//! its next pair. Relayed messages are enqueued inside the registry
//! transaction that resolves the partner, so nothing from a former partner
//! arrives after the signal that ended the pair.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tandem_core::errors::PairingError;
use tandem_core::ids::ConnectionId;
use tandem_core::metrics::{PAIRING_PARTNER_LOST_TOTAL, PAIRING_SWAPS_TOTAL, PROTOCOL_ERRORS_TOTAL};
use tandem_core::protocol::{ClientCommand, ControlSignal};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::matchmaker::Matchmaker;
use crate::registry::{ConnectionRegistry, ConnectionStatus, Removed};
use crate::relay::{Relay, RelayOutcome};

/// Tunables for session drivers.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Fallback re-scan interval while searching.
    pub search_poll_interval: Duration,
    /// Consecutive failed sends before a connection is killed.
    pub max_send_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search_poll_interval: Duration::from_secs(2),
            max_send_failures: 64,
        }
    }
}

/// Why a session driver returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The inbound stream ended (close frame or EOF).
    ClientClosed,
    /// The transport reported an error.
    TransportError,
    /// Server-initiated close (backpressure or heartbeat timeout).
    Killed,
    /// Server shutdown.
    Shutdown,
}

impl SessionEnd {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::Killed => "killed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Drives pairing connections through their lifecycle.
pub struct SessionController {
    registry: Arc<ConnectionRegistry>,
    matchmaker: Matchmaker,
    relay: Relay,
    config: SessionConfig,
    transitions: Mutex<()>,
}

impl SessionController {
    /// Create a controller over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>, config: SessionConfig) -> Self {
        Self {
            matchmaker: Matchmaker::new(registry.clone()),
            relay: Relay::new(registry.clone()),
            registry,
            config,
            transitions: Mutex::new(()),
        }
    }

    /// The registry this controller drives.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register a new connection whose frames go to `tx`.
    ///
    /// The client receives `welcome`, then `partner-found` or `waiting`.
    pub fn accept(&self, tx: &mpsc::Sender<Arc<String>>) -> Result<Arc<ClientConnection>, PairingError> {
        self.accept_with(tx, ConnectionId::new)
    }

    /// [`accept`](Self::accept) with a caller-supplied id generator.
    pub fn accept_with(
        &self,
        tx: &mpsc::Sender<Arc<String>>,
        next_id: impl FnMut() -> ConnectionId,
    ) -> Result<Arc<ClientConnection>, PairingError> {
        let _guard = self.transitions.lock();
        let connection = self
            .registry
            .admit(tx, self.config.max_send_failures, next_id)?;
        info!(client_id = %connection.id, "client connected");
        let _ = connection.send_signal(&ControlSignal::welcome(connection.id.clone()));
        if self.pair_up_locked(&connection.id).is_none() {
            let _ = connection.send_signal(&ControlSignal::Waiting);
        }
        Ok(connection)
    }

    /// Process one inbound text frame from `id`.
    ///
    /// Malformed frames are answered with an `error` signal and otherwise
    /// ignored. Frames for closed connections are ignored.
    pub fn handle_inbound(&self, id: &ConnectionId, text: &str) {
        let Some(connection) = self.registry.connection(id) else {
            debug!(client_id = %id, "frame for closed connection ignored");
            return;
        };
        match ClientCommand::parse(text) {
            Err(e) => {
                counter!(PROTOCOL_ERRORS_TOTAL).increment(1);
                warn!(client_id = %id, error = %e, "malformed message dropped");
                let _ = connection.send_signal(&ControlSignal::Error {
                    message: e.to_string(),
                });
            }
            Ok(ClientCommand::KeepAlive) => connection.mark_alive(),
            Ok(ClientCommand::Swap) => self.swap(id),
            Ok(ClientCommand::Relay(envelope)) => {
                if self.relay.forward(id, &envelope) == RelayOutcome::PartnerGone {
                    debug!(client_id = %id, kind = envelope.kind(), "no partner, message dropped");
                    let _ = self.pair_up(id);
                }
            }
        }
    }

    /// Leave the current partner. Both sides get `partner-changed` and are
    /// re-matched (never with each other) or told `waiting`. A client that
    /// is already searching is just told `waiting` again.
    pub fn swap(&self, id: &ConnectionId) {
        let _guard = self.transitions.lock();
        let Some(connection) = self.registry.connection(id) else {
            return;
        };
        let Some(former) = self.registry.unpair(id) else {
            let _ = connection.send_signal(&ControlSignal::Waiting);
            return;
        };

        counter!(PAIRING_SWAPS_TOTAL).increment(1);
        info!(client_id = %id, partner_id = %former, "swapped");
        let _ = connection.send_signal(&ControlSignal::PartnerChanged {
            partner_id: former.clone(),
        });
        if let Some(other) = self.registry.connection(&former) {
            let _ = other.send_signal(&ControlSignal::PartnerChanged {
                partner_id: id.clone(),
            });
        }
        self.rematch_locked(id);
        self.rematch_locked(&former);
    }

    /// Try to pair a searching connection. Both sides get `partner-found`
    /// on success.
    pub fn pair_up(&self, id: &ConnectionId) -> Option<ConnectionId> {
        let _guard = self.transitions.lock();
        self.pair_up_locked(id)
    }

    /// Remove `id`. A former partner gets exactly one
    /// `partner-disconnected` and is re-matched or told `waiting`.
    /// Idempotent.
    pub fn disconnect(&self, id: &ConnectionId) -> Option<Removed> {
        let _guard = self.transitions.lock();
        let removed = self.registry.remove(id)?;
        info!(
            client_id = %id,
            age_secs = removed.connection.age().as_secs(),
            dropped = removed.connection.drop_count(),
            "client disconnected"
        );
        if let Some(survivor) = &removed.former_partner {
            counter!(PAIRING_PARTNER_LOST_TOTAL).increment(1);
            if let Some(connection) = self.registry.connection(survivor) {
                let _ = connection.send_signal(&ControlSignal::PartnerDisconnected {
                    partner_id: id.clone(),
                });
            }
            self.rematch_locked(survivor);
        }
        Some(removed)
    }

    /// Current status; `Closed` once removed.
    pub fn status(&self, id: &ConnectionId) -> ConnectionStatus {
        self.registry
            .lookup(id)
            .map_or(ConnectionStatus::Closed, |snapshot| snapshot.status)
    }

    /// Drive `connection` until its inbound stream ends, it is killed, or
    /// `shutdown` fires. Always finishes with [`disconnect`](Self::disconnect).
    ///
    /// While searching, the driver re-tries matchmaking whenever the
    /// registry signals a new searcher, and at least every
    /// `search_poll_interval`.
    #[instrument(skip_all, fields(client_id = %connection.id))]
    pub async fn run<S, E>(&self, connection: Arc<ClientConnection>, inbound: S, shutdown: CancellationToken) -> SessionEnd
    where
        S: Stream<Item = Result<String, E>>,
        E: Display,
    {
        let id = connection.id.clone();
        let mut inbound = std::pin::pin!(inbound);
        let mut poll = tokio::time::interval(self.config.search_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = poll.tick().await;

        let end = loop {
            let wakeup = self.registry.search_wakeup().notified();
            let searching = self.status(&id) == ConnectionStatus::Searching;
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break SessionEnd::Shutdown,
                () = connection.killed() => break SessionEnd::Killed,
                frame = inbound.next() => match frame {
                    Some(Ok(text)) => self.handle_inbound(&id, &text),
                    Some(Err(e)) => {
                        warn!(error = %e, "transport error");
                        break SessionEnd::TransportError;
                    }
                    None => break SessionEnd::ClientClosed,
                },
                () = wakeup, if searching => {
                    let _ = self.pair_up(&id);
                }
                _ = poll.tick(), if searching => {
                    let _ = self.pair_up(&id);
                }
            }
        };

        debug!(reason = end.as_str(), "session ending");
        let _ = self.disconnect(&id);
        end
    }

    fn pair_up_locked(&self, id: &ConnectionId) -> Option<ConnectionId> {
        let partner = self.matchmaker.find_partner(id)?;
        for (me, other) in [(id, &partner), (&partner, id)] {
            if let Some(connection) = self.registry.connection(me) {
                let _ = connection.send_signal(&ControlSignal::PartnerFound {
                    partner_id: other.clone(),
                });
            }
        }
        Some(partner)
    }

    /// Re-match a connection that just lost its partner.
    fn rematch_locked(&self, id: &ConnectionId) {
        if self.status(id) != ConnectionStatus::Searching {
            return;
        }
        if self.pair_up_locked(id).is_some() {
            return;
        }
        if let Some(connection) = self.registry.connection(id) {
            let _ = connection.send_signal(&ControlSignal::Waiting);
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
