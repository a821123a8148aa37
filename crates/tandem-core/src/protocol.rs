//! Wire protocol between clients and the signaling server.
//!
//! Every frame is a JSON object with a string `type` field.
//!
//! Inbound (client → server):
//! - `{"type":"swap"}` leaves the current partner and re-enters matchmaking
//! - `{"type":"ping"}` is an application-level keep-alive
//! - anything else is an application message ([`Envelope`]) relayed to the
//!   partner (pairing mode) or to every other client (broadcast mode)
//!
//! Outbound (server → client):
//! - relayed envelopes, with `sender_id` stamped by the server
//! - [`ControlSignal`]s generated at each pairing transition

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::ConnectionId;

/// Routing field stamped on every relayed message.
pub const SENDER_FIELD: &str = "sender_id";

const TYPE_FIELD: &str = "type";

/// `type` values owned by the server. Clients may not send them as
/// application messages.
const RESERVED_TYPES: &[&str] = &[
    "welcome",
    "partner-found",
    "waiting",
    "partner-disconnected",
    "partner-changed",
    "error",
];

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Leave the current partner and look for a new one.
    Swap,
    /// Keep-alive; no routing.
    KeepAlive,
    /// Opaque application message to relay.
    Relay(Envelope),
}

impl ClientCommand {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match fields.remove(TYPE_FIELD) {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(ProtocolError::MissingType),
        };
        if kind == "swap" {
            return Ok(Self::Swap);
        }
        if kind == "ping" {
            return Ok(Self::KeepAlive);
        }
        if RESERVED_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::ReservedType(kind));
        }
        // Routing metadata is server-owned; a client cannot spoof it.
        let _ = fields.remove(SENDER_FIELD);
        Ok(Self::Relay(Envelope { kind, fields }))
    }
}

/// An application message: its `type` plus opaque payload fields.
///
/// `sender_id` is never stored here; it is attached on the way out by
/// [`Envelope::to_wire`].
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    kind: String,
    fields: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope from a type and payload fields.
    ///
    /// `type` and `sender_id` keys in `fields` are discarded.
    pub fn new(kind: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        let _ = fields.remove(TYPE_FIELD);
        let _ = fields.remove(SENDER_FIELD);
        Self {
            kind: kind.into(),
            fields,
        }
    }

    /// The message `type`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Payload fields, excluding `type` and `sender_id`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Serialize for delivery, tagged with the sender's id.
    pub fn to_wire(&self, sender: &ConnectionId) -> String {
        let mut out = Map::with_capacity(self.fields.len() + 2);
        let _ = out.insert(TYPE_FIELD.into(), Value::String(self.kind.clone()));
        let _ = out.insert(SENDER_FIELD.into(), Value::String(sender.to_string()));
        for (k, v) in &self.fields {
            let _ = out.insert(k.clone(), v.clone());
        }
        Value::Object(out).to_string()
    }
}

/// Server-generated notification pushed outside the relay path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlSignal {
    /// First frame on every connection: the id the server assigned.
    Welcome {
        /// The client's own connection id.
        client_id: ConnectionId,
        /// RFC 3339 server time.
        timestamp: String,
    },
    /// The client has been paired.
    PartnerFound {
        /// The new partner's id.
        partner_id: ConnectionId,
    },
    /// No partner is available yet.
    Waiting,
    /// The partner's connection closed; the client is searching again.
    PartnerDisconnected {
        /// The partner that left.
        partner_id: ConnectionId,
    },
    /// A swap dissolved the pair; the client is searching again.
    PartnerChanged {
        /// The partner that was left behind.
        partner_id: ConnectionId,
    },
    /// A frame from this client was rejected.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

impl ControlSignal {
    /// Build a `welcome` stamped with the current time.
    pub fn welcome(client_id: ConnectionId) -> Self {
        Self::Welcome {
            client_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize control signal");
            String::new()
        })
    }
}
