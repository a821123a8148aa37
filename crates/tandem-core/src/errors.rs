//! Error taxonomy for pairing and the wire protocol.
//!
//! - [`PairingError`]: registry-level failures (absent id, id collision, closed)
//! - [`ClaimError`]: why a transactional pair claim did not happen
//! - [`ProtocolError`]: malformed inbound frames
//!
//! A partner that has gone away is not an error; see `RelayOutcome` in
//! `tandem-pairing`.

use thiserror::Error;

use crate::ids::ConnectionId;

/// Errors raised by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    /// The id is not (or no longer) registered. Callers treat this as
    /// "already gone".
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    /// The id generator produced an id that is already live. Fatal to the
    /// single registration attempt only.
    #[error("connection id {0} is already registered")]
    DuplicateIdentity(ConnectionId),

    /// The registry no longer accepts connections (server shutting down).
    #[error("registry is closed")]
    Closed,
}

/// Why a transactional claim of two searching connections was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// The requester is no longer searching (claimed by a third party or gone).
    #[error("requester is not searching")]
    RequesterUnavailable,

    /// The candidate is no longer searching (claimed by a third party or gone).
    #[error("candidate is not searching")]
    CandidateUnavailable,
}

/// A client frame that could not be interpreted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The frame is JSON but not an object.
    #[error("message must be a JSON object")]
    NotAnObject,

    /// The object has no string `type` field.
    #[error("message is missing a string \"type\" field")]
    MissingType,

    /// The `type` is reserved for server-generated control signals.
    #[error("message type \"{0}\" is reserved")]
    ReservedType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn not_found_display() {
        let err = PairingError::NotFound(ConnectionId::from("conn_1"));
        assert_eq!(err.to_string(), "connection conn_1 not found");
    }

    #[test]
    fn duplicate_display() {
        let err = PairingError::DuplicateIdentity(ConnectionId::from("conn_2"));
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn claim_error_display() {
        assert_eq!(
            ClaimError::CandidateUnavailable.to_string(),
            "candidate is not searching"
        );
    }

    #[test]
    fn json_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert_matches!(err, ProtocolError::InvalidJson(_));
        assert!(err.to_string().starts_with("invalid JSON"));
    }
}
