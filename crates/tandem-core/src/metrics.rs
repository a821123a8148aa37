//! Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter, labels: mode).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: mode).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge, labels: mode).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram, labels: mode).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused because the server was at capacity (counter).
pub const WS_REJECTED_TOTAL: &str = "ws_rejected_total";
/// Pairs formed by the matchmaker (counter).
pub const PAIRING_MATCHES_TOTAL: &str = "pairing_matches_total";
/// Explicit swap requests that dissolved a pair (counter).
pub const PAIRING_SWAPS_TOTAL: &str = "pairing_swaps_total";
/// Pairs dissolved by a disconnect (counter).
pub const PAIRING_PARTNER_LOST_TOTAL: &str = "pairing_partner_lost_total";
/// Claims lost to a concurrent matchmaker (counter).
pub const PAIRING_CLAIM_CONFLICTS_TOTAL: &str = "pairing_claim_conflicts_total";
/// Time spent searching before a pair formed (histogram).
pub const PAIRING_WAIT_SECONDS: &str = "pairing_wait_seconds";
/// Messages relayed to a partner (counter).
pub const RELAY_MESSAGES_TOTAL: &str = "relay_messages_total";
/// Messages dropped because a recipient queue was full or closed (counter).
pub const RELAY_DROPS_TOTAL: &str = "relay_drops_total";
/// Messages fanned out in broadcast mode (counter).
pub const BROADCAST_MESSAGES_TOTAL: &str = "broadcast_messages_total";
/// Malformed inbound frames (counter).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Connections killed by the server for being unresponsive (counter, labels: reason).
pub const CONNECTIONS_KILLED_TOTAL: &str = "connections_killed_total";
