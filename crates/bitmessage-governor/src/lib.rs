//! Bitmessage Governor -- known-peer registry and outbound admission.
//!
//! Driven by the client's housekeeping tick (every 1s). Each tick tops the
//! outbound connection count back up to `max_outbound` with a random pick
//! of retry-eligible peers.

pub mod registry;

pub use registry::{Peer, PeerId, PeerRegistry};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Housekeeping tick interval.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound connections the governor maintains.
pub const MAX_OUTBOUND_CONNECTIONS: usize = 8;

/// Soft inbound cap. Exceeding it is logged, not enforced.
pub const MAX_INBOUND_CONNECTIONS: usize = 100;

/// Minimum time after a failure before a peer is dialed again.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetsError {
    #[error("max_outbound must be at least 1")]
    NoOutbound,
    #[error("housekeeping interval must be non-zero")]
    ZeroHousekeeping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorTargets {
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub min_retry_interval_secs: u64,
    pub housekeeping_interval_secs: u64,
}

impl Default for GovernorTargets {
    fn default() -> Self {
        Self {
            max_outbound: MAX_OUTBOUND_CONNECTIONS,
            max_inbound: MAX_INBOUND_CONNECTIONS,
            min_retry_interval_secs: MIN_RETRY_INTERVAL.as_secs(),
            housekeeping_interval_secs: HOUSEKEEPING_INTERVAL.as_secs(),
        }
    }
}

impl GovernorTargets {
    pub fn validate(&self) -> Result<(), TargetsError> {
        if self.max_outbound == 0 {
            return Err(TargetsError::NoOutbound);
        }
        if self.housekeeping_interval_secs == 0 {
            return Err(TargetsError::ZeroHousekeeping);
        }
        Ok(())
    }

    pub fn min_retry_interval(&self) -> Duration {
        Duration::from_secs(self.min_retry_interval_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }
}

/// Actions the governor wants the client to take after a tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GovernorActions {
    /// Peers to dial.
    pub connect: Vec<PeerId>,
}

/// Outbound admission control over the peer registry.
#[derive(Debug)]
pub struct Governor {
    registry: PeerRegistry,
    targets: GovernorTargets,
}

impl Governor {
    pub fn new(targets: GovernorTargets) -> Self {
        Self {
            registry: PeerRegistry::new(),
            targets,
        }
    }

    pub fn targets(&self) -> &GovernorTargets {
        &self.targets
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Remember a peer. Duplicate addresses become separate entries.
    pub fn add_peer(&mut self, host: impl Into<String>, port: u16, services: u64) -> PeerId {
        self.registry.add(Peer::new(host, port, services))
    }

    pub fn remove_peer(&mut self, id: PeerId) -> Option<Peer> {
        self.registry.remove(id)
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.registry.get(id)
    }

    /// Record a failed dial, or a connection that closed before handshaking.
    pub fn mark_dial_failed(&mut self, id: PeerId, at: Instant) {
        self.registry.mark_failed(id, at);
    }

    /// Whether `inbound_count` is over the soft inbound cap.
    pub fn inbound_over_cap(&self, inbound_count: usize) -> bool {
        inbound_count > self.targets.max_inbound
    }

    /// One housekeeping pass.
    ///
    /// `outbound` holds the peers we already have an outbound connection to,
    /// including dials still in flight. Those are excluded from candidates and
    /// count toward `max_outbound`.
    pub fn tick<R: Rng + ?Sized>(
        &self,
        outbound: &HashSet<PeerId>,
        now: Instant,
        rng: &mut R,
    ) -> GovernorActions {
        let mut actions = GovernorActions::default();

        let current = outbound.len();
        if current >= self.targets.max_outbound {
            return actions;
        }
        let wanted = self.targets.max_outbound - current;

        let mut candidates =
            self.registry
                .retry_candidates(outbound, now, self.targets.min_retry_interval());
        if candidates.is_empty() {
            return actions;
        }

        tracing::debug!(
            current,
            max = self.targets.max_outbound,
            candidates = candidates.len(),
            "attempting more outbound connections"
        );

        candidates.shuffle(rng);
        candidates.truncate(wanted);
        actions.connect = candidates;
        actions
    }
}
