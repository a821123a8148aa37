//! Connection registry: the single source of truth for pairing state.
//!
//! All status, partner and queue mutations happen under one
//! `parking_lot::Mutex`, so every operation here is a transaction. The
//! registry does not compose control signals; callers read the returned
//! outcome and notify clients themselves. Its one send is the relay enqueue
//! in [`ConnectionRegistry::send_to_partner`].
//!
//! Searching connections sit in one ordered queue keyed by `(class, seq)`:
//! class `0` is the re-match queue (swap or partner-loss survivors), class
//! `1` is fresh arrivals. Iterating the map yields re-match FIFO then fresh
//! FIFO.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tandem_core::errors::{ClaimError, PairingError};
use tandem_core::ids::ConnectionId;
use tandem_core::metrics::WS_CONNECTIONS_ACTIVE;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// Registration attempts before giving up on id collisions.
pub const MAX_ACCEPT_ATTEMPTS: usize = 3;

const REMATCH: u8 = 0;
const FRESH: u8 = 1;

type QueueKey = (u8, u64);

/// Pairing status of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No partner; eligible for matchmaking.
    Searching,
    /// Symmetrically paired with one partner.
    Paired,
    /// Removed from the registry. Terminal.
    Closed,
}

/// Status and partner of one connection, read at a single instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// The connection.
    pub id: ConnectionId,
    /// Current status.
    pub status: ConnectionStatus,
    /// Current partner, set only while paired.
    pub partner: Option<ConnectionId>,
    /// Partner left by the most recent swap.
    pub last_partner: Option<ConnectionId>,
    /// How long the connection has been searching, if it is.
    pub searching_for: Option<Duration>,
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Removed {
    /// The removed connection's handle.
    pub connection: Arc<ClientConnection>,
    /// Partner detached by the removal, now back in the re-match queue.
    pub former_partner: Option<ConnectionId>,
}

/// Aggregate counts for health reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    /// All live connections.
    pub total: usize,
    /// Connections waiting for a partner.
    pub searching: usize,
    /// Connections in a pair (always even).
    pub paired: usize,
}

struct Entry {
    connection: Arc<ClientConnection>,
    status: ConnectionStatus,
    partner: Option<ConnectionId>,
    last_partner: Option<ConnectionId>,
    queue_key: Option<QueueKey>,
    searching_since: Option<Instant>,
}

impl Entry {
    fn snapshot(&self, id: &ConnectionId) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: id.clone(),
            status: self.status,
            partner: self.partner.clone(),
            last_partner: self.last_partner.clone(),
            searching_for: self.searching_since.map(|t| t.elapsed()),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ConnectionId, Entry>,
    queue: BTreeMap<QueueKey, ConnectionId>,
    next_seq: u64,
    closed: bool,
}

impl Inner {
    /// Move `id` to SEARCHING at the back of the queue of `class`.
    fn enqueue(&mut self, id: &ConnectionId, class: u8) {
        let key = (class, self.next_seq);
        self.next_seq += 1;
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if let Some(old) = entry.queue_key.replace(key) {
            let _ = self.queue.remove(&old);
        }
        entry.status = ConnectionStatus::Searching;
        entry.partner = None;
        entry.searching_since = Some(Instant::now());
        let _ = self.queue.insert(key, id.clone());
    }

    /// Drop the swap block held by `id` and the mirror block its last
    /// partner holds against it. A block only survives until either side
    /// pairs elsewhere or leaves.
    fn release_block(&mut self, id: &ConnectionId, last_partner: Option<ConnectionId>) {
        let Some(other) = last_partner else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&other) {
            if entry.last_partner.as_ref() == Some(id) {
                entry.last_partner = None;
            }
        }
    }

    fn is_searching(&self, id: &ConnectionId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.status == ConnectionStatus::Searching)
    }
}

/// Registry of live connections and their pairing state.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    wakeup: Notify,
    label: &'static str,
}

impl ConnectionRegistry {
    /// Create an empty registry. `label` tags its gauges and logs
    /// (`"pairing"` or `"broadcast"`).
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wakeup: Notify::new(),
            label,
        }
    }

    /// Add a connection as SEARCHING at the back of the fresh queue.
    pub fn register(&self, connection: Arc<ClientConnection>) -> Result<ConnectionId, PairingError> {
        let id = connection.id.clone();
        let total = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PairingError::Closed);
            }
            if inner.entries.contains_key(&id) {
                return Err(PairingError::DuplicateIdentity(id));
            }
            let _ = inner.entries.insert(
                id.clone(),
                Entry {
                    connection,
                    status: ConnectionStatus::Searching,
                    partner: None,
                    last_partner: None,
                    queue_key: None,
                    searching_since: None,
                },
            );
            inner.enqueue(&id, FRESH);
            inner.entries.len()
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_CONNECTIONS_ACTIVE, "mode" => self.label).set(total as f64);
        debug!(client_id = %id, registry = self.label, "registered");
        self.notify_searchers();
        Ok(id)
    }

    /// Build a connection with a fresh id and register it, retrying id
    /// collisions up to [`MAX_ACCEPT_ATTEMPTS`] times.
    pub fn admit(
        &self,
        tx: &mpsc::Sender<Arc<String>>,
        max_send_failures: u32,
        mut next_id: impl FnMut() -> ConnectionId,
    ) -> Result<Arc<ClientConnection>, PairingError> {
        let mut last_err = PairingError::Closed;
        for attempt in 1..=MAX_ACCEPT_ATTEMPTS {
            let connection = Arc::new(ClientConnection::new(next_id(), tx.clone(), max_send_failures));
            match self.register(connection.clone()) {
                Ok(_) => return Ok(connection),
                Err(PairingError::DuplicateIdentity(id)) => {
                    warn!(client_id = %id, attempt, "connection id collision, retrying");
                    last_err = PairingError::DuplicateIdentity(id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Status and partner of `id` as of one consistent instant.
    pub fn lookup(&self, id: &ConnectionId) -> Result<ConnectionSnapshot, PairingError> {
        self.inner
            .lock()
            .entries
            .get(id)
            .map(|e| e.snapshot(id))
            .ok_or_else(|| PairingError::NotFound(id.clone()))
    }

    /// Remove `id`. Its partner, if any, returns to SEARCHING at the back of
    /// the re-match queue, and a swap block held against `id` is released.
    /// Removing an absent id returns `None`.
    pub fn remove(&self, id: &ConnectionId) -> Option<Removed> {
        let (removed, total) = {
            let mut inner = self.inner.lock();
            let entry = inner.entries.remove(id)?;
            if let Some(key) = entry.queue_key {
                let _ = inner.queue.remove(&key);
            }
            inner.release_block(id, entry.last_partner);
            let former_partner = entry.partner.filter(|p| inner.entries.contains_key(p));
            if let Some(partner) = &former_partner {
                inner.enqueue(partner, REMATCH);
            }
            (
                Removed {
                    connection: entry.connection,
                    former_partner,
                },
                inner.entries.len(),
            )
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_CONNECTIONS_ACTIVE, "mode" => self.label).set(total as f64);
        debug!(client_id = %id, registry = self.label, "removed");
        if removed.former_partner.is_some() {
            self.notify_searchers();
        }
        Some(removed)
    }

    /// SEARCHING ids in matchmaking order: re-match FIFO, then fresh FIFO.
    pub fn snapshot_searching(&self) -> Vec<ConnectionId> {
        self.inner.lock().queue.values().cloned().collect()
    }

    /// Pair `requester` with `candidate` if both are SEARCHING and neither
    /// just swapped away from the other. Nothing changes on error.
    ///
    /// On success both sides drop their swap blocks, and so does anyone
    /// still blocked against them.
    pub fn claim_pair(&self, requester: &ConnectionId, candidate: &ConnectionId) -> Result<(), ClaimError> {
        let mut inner = self.inner.lock();
        if !inner.is_searching(requester) {
            return Err(ClaimError::RequesterUnavailable);
        }
        if requester == candidate || !inner.is_searching(candidate) {
            return Err(ClaimError::CandidateUnavailable);
        }
        let blocked = |a: &ConnectionId, b: &ConnectionId| {
            inner
                .entries
                .get(a)
                .is_some_and(|e| e.last_partner.as_ref() == Some(b))
        };
        if blocked(requester, candidate) || blocked(candidate, requester) {
            return Err(ClaimError::CandidateUnavailable);
        }

        for (me, other) in [(requester, candidate), (candidate, requester)] {
            let Some(entry) = inner.entries.get_mut(me) else {
                continue;
            };
            entry.status = ConnectionStatus::Paired;
            entry.partner = Some(other.clone());
            entry.searching_since = None;
            let key = entry.queue_key.take();
            let last = entry.last_partner.take();
            if let Some(key) = key {
                let _ = inner.queue.remove(&key);
            }
            inner.release_block(me, last);
        }
        Ok(())
    }

    /// Dissolve the pair containing `id`. Both sides return to SEARCHING at
    /// the back of the re-match queue, `id` first, each remembering the
    /// other as its last partner. Returns the former partner, or `None` if
    /// `id` was not paired.
    pub fn unpair(&self, id: &ConnectionId) -> Option<ConnectionId> {
        let partner = {
            let mut inner = self.inner.lock();
            let partner = inner.entries.get(id)?.partner.clone()?;
            inner.enqueue(id, REMATCH);
            inner.enqueue(&partner, REMATCH);
            for (me, other) in [(id, &partner), (&partner, id)] {
                if let Some(entry) = inner.entries.get_mut(me) {
                    entry.last_partner = Some(other.clone());
                }
            }
            partner
        };
        self.notify_searchers();
        Some(partner)
    }

    /// Handle for `id`, if live.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.inner.lock().entries.get(id).map(|e| e.connection.clone())
    }

    /// Handle of `id`'s current partner, resolved under one lock.
    pub fn partner_of(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let inner = self.inner.lock();
        let partner = inner.entries.get(id)?.partner.as_ref()?;
        inner.entries.get(partner).map(|e| e.connection.clone())
    }

    /// Enqueue `message` on `id`'s current partner while holding the
    /// registry lock, so the send cannot interleave with an unpair or a
    /// removal. Returns the partner and whether the enqueue succeeded, or
    /// `None` if `id` has no partner.
    pub fn send_to_partner(&self, id: &ConnectionId, message: Arc<String>) -> Option<(ConnectionId, bool)> {
        let inner = self.inner.lock();
        let partner = inner.entries.get(id)?.partner.as_ref()?;
        let entry = inner.entries.get(partner)?;
        Some((partner.clone(), entry.connection.send(message)))
    }

    /// Handles of every live connection.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.connection.clone())
            .collect()
    }

    /// Status totals.
    pub fn counts(&self) -> RegistryCounts {
        let inner = self.inner.lock();
        let searching = inner.queue.len();
        RegistryCounts {
            total: inner.entries.len(),
            searching,
            paired: inner.entries.len() - searching,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further registrations. Existing connections are unaffected.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Event signalled whenever a connection enters SEARCHING.
    pub fn search_wakeup(&self) -> &Notify {
        &self.wakeup
    }

    /// Wake every searching session.
    pub fn notify_searchers(&self) {
        self.wakeup.notify_waiters();
    }

    /// Verify the pairing invariants. Returns a description of the first
    /// violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock();
        for (id, entry) in &inner.entries {
            match entry.status {
                ConnectionStatus::Searching => {
                    if entry.partner.is_some() {
                        return Err(format!("{id} is searching but has a partner"));
                    }
                    let queued = entry.queue_key.and_then(|k| inner.queue.get(&k));
                    if queued != Some(id) {
                        return Err(format!("{id} is searching but not queued"));
                    }
                }
                ConnectionStatus::Paired => {
                    let Some(partner) = &entry.partner else {
                        return Err(format!("{id} is paired without a partner"));
                    };
                    if partner == id {
                        return Err(format!("{id} is paired with itself"));
                    }
                    let back = inner.entries.get(partner).and_then(|p| p.partner.as_ref());
                    if back != Some(id) {
                        return Err(format!("{id} -> {partner} is not symmetric"));
                    }
                    if entry.queue_key.is_some() {
                        return Err(format!("{id} is paired but still queued"));
                    }
                }
                ConnectionStatus::Closed => {
                    return Err(format!("{id} is closed but still registered"));
                }
            }
        }
        if inner.queue.len() > inner.entries.len() {
            return Err("queue holds more ids than the registry".into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("label", &self.label)
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}
