//! Server, pairing, and logging settings.

use serde::{Deserialize, Serialize};

/// Server network and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Maximum concurrent WebSocket connections across both endpoints.
    pub max_connections: usize,
    /// Interval between server pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without a pong, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// How long to wait for sessions to finish on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Matchmaking and relay settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairingSettings {
    /// Fallback re-scan interval for a searching client, in milliseconds.
    /// Searches are normally woken by arrivals; this bounds a missed wakeup.
    pub search_poll_interval_ms: u64,
    /// Capacity of each client's outbound queue.
    pub send_queue_capacity: usize,
    /// Consecutive failed sends after which a client is disconnected.
    pub max_send_failures: u32,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            search_poll_interval_ms: 2_000,
            send_queue_capacity: 256,
            max_send_failures: 64,
        }
    }
}

/// Log verbosity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace-level (most verbose).
    Trace,
    /// Debug-level.
    Debug,
    /// Info-level (default).
    #[default]
    Info,
    /// Warning-level.
    Warn,
    /// Error-level.
    Error,
}

impl LogLevel {
    /// Convert to a tracing filter string.
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Log line format.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level. `RUST_LOG` still wins when set.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}
