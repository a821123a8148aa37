//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;
use tandem_pairing::RegistryCounts;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections across both modes.
    pub connections: usize,
    /// Pairing clients waiting for a partner.
    pub searching: usize,
    /// Pairing clients currently in a pair.
    pub paired: usize,
    /// Broadcast-mode clients.
    pub broadcast_connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    pairing: RegistryCounts,
    broadcast_connections: usize,
    shutting_down: bool,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: pairing.total + broadcast_connections,
        searching: pairing.searching,
        paired: pairing.paired,
        broadcast_connections,
    }
}
