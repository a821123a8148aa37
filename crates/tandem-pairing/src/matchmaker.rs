//! Partner selection.

use std::sync::Arc;

use metrics::{counter, histogram};
use tandem_core::errors::ClaimError;
use tandem_core::ids::ConnectionId;
use tandem_core::metrics::{PAIRING_CLAIM_CONFLICTS_TOTAL, PAIRING_MATCHES_TOTAL, PAIRING_WAIT_SECONDS};
use tracing::{debug, info};

use crate::registry::{ConnectionRegistry, ConnectionStatus};

/// Selects and atomically claims a partner for a searching connection.
#[derive(Debug, Clone)]
pub struct Matchmaker {
    registry: Arc<ConnectionRegistry>,
}

impl Matchmaker {
    /// Create a matchmaker over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Find and claim a partner for `requester`, oldest waiter first.
    ///
    /// Candidates claimed by someone else between scan and claim are
    /// skipped. Returns `None` if nobody is available or the requester
    /// itself stopped searching.
    pub fn find_partner(&self, requester: &ConnectionId) -> Option<ConnectionId> {
        let me = self.registry.lookup(requester).ok()?;
        if me.status != ConnectionStatus::Searching {
            return None;
        }

        for candidate in self.registry.snapshot_searching() {
            if &candidate == requester || me.last_partner.as_ref() == Some(&candidate) {
                continue;
            }
            let Ok(theirs) = self.registry.lookup(&candidate) else {
                continue;
            };
            if theirs.last_partner.as_ref() == Some(requester) {
                continue;
            }

            match self.registry.claim_pair(requester, &candidate) {
                Ok(()) => {
                    counter!(PAIRING_MATCHES_TOTAL).increment(1);
                    for waited in [me.searching_for, theirs.searching_for].into_iter().flatten() {
                        histogram!(PAIRING_WAIT_SECONDS).record(waited.as_secs_f64());
                    }
                    info!(client_id = %requester, partner_id = %candidate, "paired");
                    return Some(candidate);
                }
                Err(ClaimError::CandidateUnavailable) => {
                    counter!(PAIRING_CLAIM_CONFLICTS_TOTAL).increment(1);
                    debug!(client_id = %requester, candidate = %candidate, "candidate taken, trying next");
                }
                Err(ClaimError::RequesterUnavailable) => {
                    debug!(client_id = %requester, "no longer searching, abandoning scan");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConnection;
    use tokio::sync::mpsc;

    fn id(s: &str) -> ConnectionId {
        ConnectionId::from(s)
    }

    fn setup(names: &[&str]) -> (Arc<ConnectionRegistry>, Matchmaker, Vec<mpsc::Receiver<Arc<String>>>) {
        let registry = Arc::new(ConnectionRegistry::new("pairing"));
        let mut rxs = Vec::new();
        for name in names {
            let (tx, rx) = mpsc::channel(8);
            let _ = registry
                .register(Arc::new(ClientConnection::new(id(name), tx, 8)))
                .unwrap();
            rxs.push(rx);
        }
        let mm = Matchmaker::new(registry.clone());
        (registry, mm, rxs)
    }

    #[test]
    fn oldest_waiter_is_chosen() {
        let (reg, mm, _rxs) = setup(&["a", "b", "c", "d"]);
        assert_eq!(mm.find_partner(&id("d")), Some(id("a")));
        assert_eq!(reg.lookup(&id("b")).unwrap().status, ConnectionStatus::Searching);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn alone_finds_nobody() {
        let (reg, mm, _rxs) = setup(&["a"]);
        assert_eq!(mm.find_partner(&id("a")), None);
        assert_eq!(reg.lookup(&id("a")).unwrap().status, ConnectionStatus::Searching);
    }

    #[test]
    fn paired_requester_stops() {
        let (reg, mm, _rxs) = setup(&["a", "b", "c"]);
        reg.claim_pair(&id("a"), &id("b")).unwrap();
        assert_eq!(mm.find_partner(&id("a")), None);
        assert_eq!(reg.lookup(&id("c")).unwrap().status, ConnectionStatus::Searching);
    }

    #[test]
    fn unknown_requester_finds_nobody() {
        let (_reg, mm, _rxs) = setup(&["a"]);
        assert_eq!(mm.find_partner(&id("ghost")), None);
    }

    #[test]
    fn skips_last_partner_both_ways() {
        let (reg, mm, _rxs) = setup(&["a", "b"]);
        reg.claim_pair(&id("a"), &id("b")).unwrap();
        let _ = reg.unpair(&id("a")).unwrap();
        assert_eq!(mm.find_partner(&id("a")), None);
        assert_eq!(mm.find_partner(&id("b")), None);
    }

    #[test]
    fn swapped_pair_takes_third_party() {
        let (reg, mm, _rxs) = setup(&["a", "b", "c"]);
        reg.claim_pair(&id("a"), &id("b")).unwrap();
        let _ = reg.unpair(&id("a")).unwrap();
        // a is first in the re-match queue, c is the only eligible partner.
        assert_eq!(mm.find_partner(&id("a")), Some(id("c")));
        assert_eq!(mm.find_partner(&id("b")), None);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn concurrent_searchers_never_double_book() {
        let names: Vec<String> = (0..64).map(|i| format!("c{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (reg, mm, _rxs) = setup(&refs);

        std::thread::scope(|s| {
            for chunk in names.chunks(8) {
                let mm = mm.clone();
                let _ = s.spawn(move || {
                    for name in chunk {
                        let _ = mm.find_partner(&ConnectionId::from(name.as_str()));
                    }
                });
            }
        });

        reg.check_invariants().unwrap();
        let counts = reg.counts();
        assert_eq!(counts.total, 64);
        assert_eq!(counts.paired % 2, 0);
        // Every searcher ran once and nobody was excluded, so at most one
        // connection is left over.
        assert!(counts.searching <= 1, "{counts:?}");
    }

    #[test]
    fn concurrent_register_remove_and_search_keep_invariants() {
        let names: Vec<String> = (0..32).map(|i| format!("s{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let (reg, mm, _rxs) = setup(&refs);
        let reg = &reg;
        let names = &names;

        std::thread::scope(|s| {
            for t in 0..4 {
                let mm = mm.clone();
                let _ = s.spawn(move || {
                    for n in 0..16 {
                        let (tx, _rx) = mpsc::channel(1);
                        let fresh = id(&format!("t{t}-{n}"));
                        let _ = reg
                            .register(Arc::new(ClientConnection::new(fresh.clone(), tx, 8)))
                            .unwrap();
                        let _ = mm.find_partner(&fresh);
                    }
                });
            }
            let _ = s.spawn(move || {
                for name in names.iter().step_by(2) {
                    let _ = reg.remove(&id(name));
                }
            });
            for chunk in names.chunks(8) {
                let mm = mm.clone();
                let _ = s.spawn(move || {
                    for name in chunk {
                        let _ = mm.find_partner(&id(name));
                        reg.check_invariants().unwrap();
                    }
                });
            }
        });

        reg.check_invariants().unwrap();
        let counts = reg.counts();
        assert_eq!(counts.total, 32 - 16 + 4 * 16);
        assert_eq!(counts.paired % 2, 0);
        for name in names.iter().step_by(2) {
            assert!(reg.lookup(&id(name)).is_err(), "{name} survived removal");
        }
    }
}
