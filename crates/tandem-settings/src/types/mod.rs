//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON is accepted and missing fields take their default value.

mod server;

pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "pairing": { "searchPollIntervalMs": 1000 },
///   "logging": { "level": "debug" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TandemSettings {
    /// Network and transport settings.
    pub server: ServerSettings,
    /// Matchmaking and relay settings.
    pub pairing: PairingSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TandemSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutSecs ({}) is shorter than heartbeatIntervalSecs ({})",
                self.server.heartbeat_timeout_secs, self.server.heartbeat_interval_secs
            )));
        }
        if self.pairing.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "pairing.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if self.pairing.max_send_failures == 0 {
            return Err(SettingsError::InvalidValue(
                "pairing.maxSendFailures must be at least 1".into(),
            ));
        }
        if self.pairing.search_poll_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "pairing.searchPollIntervalMs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
