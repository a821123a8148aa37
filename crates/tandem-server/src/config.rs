//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_pairing::SessionConfig;

/// Runtime configuration for the tandem server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections across both modes.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without a pong, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Consecutive failed sends before a connection is closed.
    pub max_send_failures: u32,
    /// Fallback matchmaking re-scan interval in milliseconds.
    pub search_poll_interval_ms: u64,
    /// How long shutdown waits for sessions to finish, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Settings for the pairing session drivers.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            search_poll_interval: Duration::from_millis(self.search_poll_interval_ms.max(1)),
            max_send_failures: self.max_send_failures,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            send_queue_capacity: 256,
            max_send_failures: 64,
            search_poll_interval_ms: 2_000,
            shutdown_timeout_secs: 10,
        }
    }
}
