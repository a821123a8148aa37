//! Per-client connection handle.
//!
//! The handle is shared (`Arc`) between the registry, the session loop, the
//! transport writer and the heartbeat. It never owns the socket: outbound
//! frames go through a bounded channel drained by the transport's writer task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tandem_core::ids::ConnectionId;
use tandem_core::metrics::CONNECTIONS_KILLED_TOTAL;
use tandem_core::protocol::ControlSignal;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

/// A live client connection.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
    consecutive_failures: AtomicU32,
    max_send_failures: u32,
    kill: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection.
    ///
    /// After `max_send_failures` consecutive failed sends the connection's
    /// kill token fires.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>, max_send_failures: u32) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            max_send_failures: max_send_failures.max(1),
            kill: CancellationToken::new(),
        }
    }

    /// Enqueue a text frame without blocking.
    ///
    /// Returns `false` if the queue is full or closed. The message is then
    /// dropped and counted.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return true;
        }
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.max_send_failures && !self.kill.is_cancelled() {
            warn!(client_id = %self.id, failures, "outbound queue stuck, closing connection");
            counter!(CONNECTIONS_KILLED_TOTAL, "reason" => "backpressure").increment(1);
            self.kill.cancel();
        }
        false
    }

    /// Enqueue a control signal.
    pub fn send_signal(&self, signal: &ControlSignal) -> bool {
        self.send(Arc::new(signal.to_json()))
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Request a server-initiated close.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Whether a close has been requested.
    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Resolves once a close has been requested.
    pub fn killed(&self) -> WaitForCancellationFuture<'_> {
        self.kill.cancelled()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("dropped_messages", &self.drop_count())
            .field("killed", &self.is_killed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize, max_failures: u32) -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(ConnectionId::from("conn_1"), tx, max_failures);
        (conn, rx)
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection(8, 4);
        assert!(conn.send(Arc::new("hello".into())));
        assert_eq!(&*rx.recv().await.unwrap(), "hello");
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn send_to_closed_channel_counts_drop() {
        let (conn, rx) = make_connection(8, 4);
        drop(rx);
        assert!(!conn.send(Arc::new("hello".into())));
        assert_eq!(conn.drop_count(), 1);
        assert!(!conn.is_killed());
    }

    #[test]
    fn persistent_full_queue_kills_connection() {
        let (conn, _rx) = make_connection(1, 3);
        assert!(conn.send(Arc::new("fills".into())));
        assert!(!conn.send(Arc::new("a".into())));
        assert!(!conn.send(Arc::new("b".into())));
        assert!(!conn.is_killed());
        assert!(!conn.send(Arc::new("c".into())));
        assert!(conn.is_killed());
        assert_eq!(conn.drop_count(), 3);
    }

    #[tokio::test]
    async fn successful_send_resets_failure_streak() {
        let (conn, mut rx) = make_connection(1, 2);
        assert!(conn.send(Arc::new("1".into())));
        assert!(!conn.send(Arc::new("2".into())));
        let _ = rx.recv().await.unwrap();
        assert!(conn.send(Arc::new("3".into())));
        assert!(!conn.send(Arc::new("4".into())));
        assert!(!conn.is_killed());
    }

    #[tokio::test]
    async fn send_signal_serializes() {
        let (conn, mut rx) = make_connection(8, 4);
        assert!(conn.send_signal(&ControlSignal::Waiting));
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg, r#"{"type":"waiting"}"#);
    }

    #[test]
    fn mark_alive_and_check() {
        let (conn, _rx) = make_connection(8, 4);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[tokio::test]
    async fn killed_future_resolves_after_kill() {
        let (conn, _rx) = make_connection(8, 4);
        conn.kill();
        conn.killed().await;
        assert!(conn.is_killed());
    }

    #[test]
    fn zero_failure_limit_is_clamped() {
        let (conn, rx) = make_connection(1, 0);
        drop(rx);
        assert!(!conn.send(Arc::new("x".into())));
        assert!(conn.is_killed());
    }
}
