//! Known-peer registry.
//!
//! Peers are keyed by a registry-assigned `PeerId`, never by address, so two
//! entries with the same host and port (e.g. a duplicated bootstrap entry)
//! stay distinct.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

/// Registry-assigned identity of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// A remembered address eligible for outbound dialing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    pub services: u64,
    /// Set when a connection to this peer failed or closed before the
    /// handshake completed.
    pub last_failure: Option<Instant>,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16, services: u64) -> Self {
        Self {
            host: host.into(),
            port,
            services,
            last_failure: None,
        }
    }

    /// Eligible when it never failed, or the last failure is strictly older
    /// than `min_retry`.
    pub fn should_retry(&self, now: Instant, min_retry: Duration) -> bool {
        self.last_failure
            .is_none_or(|t| now.saturating_duration_since(t) > min_retry)
    }

    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The set of known peers. Owned by the governor.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Duplicates are kept as separate entries.
    pub fn add(&mut self, peer: Peer) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.peers.insert(id, peer);
        id
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Stamp the failure time. Unknown ids (removed meanwhile) are ignored.
    pub fn mark_failed(&mut self, id: PeerId, at: Instant) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.last_failure = Some(at);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.peers.iter().map(|(id, p)| (*id, p))
    }

    /// Peers not in `exclude` that are eligible for a retry at `now`,
    /// in id order.
    pub fn retry_candidates(
        &self,
        exclude: &HashSet<PeerId>,
        now: Instant,
        min_retry: Duration,
    ) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(id, p)| !exclude.contains(id) && p.should_retry(now, min_retry))
            .map(|(id, _)| *id)
            .collect()
    }
}
