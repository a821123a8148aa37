//! Partner-to-partner message forwarding.

use std::sync::Arc;

use metrics::counter;
use tandem_core::ids::ConnectionId;
use tandem_core::metrics::{RELAY_DROPS_TOTAL, RELAY_MESSAGES_TOTAL};
use tandem_core::protocol::Envelope;
use tracing::debug;

use crate::registry::ConnectionRegistry;

/// What happened to a forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Enqueued on the partner's outbound queue.
    Delivered,
    /// The partner's queue was full or closing; the message is gone.
    Dropped,
    /// The sender has no partner.
    PartnerGone,
}

/// Forwards application messages between paired connections.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
}

impl Relay {
    /// Create a relay over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward `envelope` from `from` to its current partner, tagged with
    /// `from` as `sender_id`. Never blocks.
    ///
    /// The partner is resolved and the message enqueued in one registry
    /// transaction: a message is either queued ahead of the partner's
    /// `partner-changed` or `partner-disconnected`, or not delivered at all.
    pub fn forward(&self, from: &ConnectionId, envelope: &Envelope) -> RelayOutcome {
        let wire = Arc::new(envelope.to_wire(from));
        let Some((partner, delivered)) = self.registry.send_to_partner(from, wire) else {
            return RelayOutcome::PartnerGone;
        };
        let kind = envelope.kind();
        if delivered {
            counter!(RELAY_MESSAGES_TOTAL).increment(1);
            debug!(client_id = %from, partner_id = %partner, kind, "relayed");
            RelayOutcome::Delivered
        } else {
            counter!(RELAY_DROPS_TOTAL).increment(1);
            debug!(client_id = %from, partner_id = %partner, kind, "relay dropped, partner queue full");
            RelayOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConnection;
    use serde_json::{Map, Value, json};
    use tokio::sync::mpsc;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn add(reg: &ConnectionRegistry, name: &str, capacity: usize) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(capacity);
        let _ = reg
            .register(Arc::new(ClientConnection::new(id(name), tx, 8)))
            .unwrap();
        rx
    }

    fn offer() -> Envelope {
        let mut fields = Map::new();
        let _ = fields.insert("sdp".into(), json!("v=0"));
        Envelope::new("offer", fields)
    }

    #[tokio::test]
    async fn delivers_to_partner_with_sender_id() {
        let reg = Arc::new(ConnectionRegistry::new("pairing"));
        let mut a_rx = add(&reg, "a", 4);
        let mut b_rx = add(&reg, "b", 4);
        reg.claim_pair(&id("a"), &id("b")).unwrap();

        let relay = Relay::new(reg);
        assert_eq!(relay.forward(&id("a"), &offer()), RelayOutcome::Delivered);

        let msg: Value = serde_json::from_str(&b_rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "offer");
        assert_eq!(msg["sender_id"], "a");
        assert_eq!(msg["sdp"], "v=0");
        assert!(a_rx.try_recv().is_err());
    }

    #[test]
    fn unpaired_sender_gets_partner_gone() {
        let reg = Arc::new(ConnectionRegistry::new("pairing"));
        let _a = add(&reg, "a", 4);
        let relay = Relay::new(reg);
        assert_eq!(relay.forward(&id("a"), &offer()), RelayOutcome::PartnerGone);
        assert_eq!(relay.forward(&id("ghost"), &offer()), RelayOutcome::PartnerGone);
    }

    #[test]
    fn full_partner_queue_drops() {
        let reg = Arc::new(ConnectionRegistry::new("pairing"));
        let _a = add(&reg, "a", 4);
        let _b = add(&reg, "b", 1);
        reg.claim_pair(&id("a"), &id("b")).unwrap();
        let relay = Relay::new(reg.clone());

        assert_eq!(relay.forward(&id("a"), &offer()), RelayOutcome::Delivered);
        assert_eq!(relay.forward(&id("a"), &offer()), RelayOutcome::Dropped);
        assert_eq!(reg.connection(&id("b")).unwrap().drop_count(), 1);
    }

    #[tokio::test]
    async fn preserves_send_order() {
        let reg = Arc::new(ConnectionRegistry::new("pairing"));
        let _a = add(&reg, "a", 8);
        let mut b_rx = add(&reg, "b", 8);
        reg.claim_pair(&id("a"), &id("b")).unwrap();
        let relay = Relay::new(reg);

        for n in 0..5 {
            let mut fields = Map::new();
            let _ = fields.insert("n".into(), json!(n));
            let _ = relay.forward(&id("a"), &Envelope::new("candidate", fields));
        }
        for n in 0..5 {
            let msg: Value = serde_json::from_str(&b_rx.recv().await.unwrap()).unwrap();
            assert_eq!(msg["n"], n);
        }
    }
}
