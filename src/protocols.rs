//! Boundary trait definitions for the hivemesh protocol core.
//!
//! The core never opens connections, picks peers, or reads the wall clock on
//! its own. Everything it needs from the outside world is expressed through
//! the traits in this module, so hosts can plug in WebRTC, WebSocket or an
//! in-memory simulation without touching protocol code.
//!
//! ## Boundary Traits
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`Transport`] | Send raw frames to connected peers, list current neighbors |
//! | [`PeerGraph`] | Best-effort adjacency of known peers (read-only) |
//! | [`Clock`] | Milliseconds since the Unix epoch, injectable for tests |
//!
//! ## Design
//!
//! Traits are defined here separately from the engines so that:
//! - The gossip engine and unicast router depend only on traits
//! - Tests can drive the whole core with deterministic time and links
//! - The router can never mutate the known-peer graph (it only gets `&self`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::identity::PeerId;

/// Transport operations consumed by both protocol engines.
pub trait Transport: Send + Sync + 'static {
    /// Deliver a frame to a currently connected peer.
    ///
    /// An error means the peer is no longer reachable; the unicast router
    /// reacts to it by attempting a re-route.
    fn send_bytes(&self, to: &PeerId, frame: &[u8]) -> Result<()>;

    /// Ids of the peers we currently hold an open connection with.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Check whether a single peer is directly connected.
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected_peers().iter().any(|p| p == peer)
    }
}

/// Approximate knowledge graph used for unicast path discovery.
///
/// Built by the topology collaborator from gossiped neighbor lists. It may be
/// stale or incomplete; the router treats every answer as a hint.
pub trait PeerGraph: Send + Sync + 'static {
    /// Known neighbors of `peer`. Unknown peers yield an empty list.
    fn neighbors_of(&self, peer: &PeerId) -> Vec<PeerId>;

    /// Whether `peer` appears in the graph at all.
    fn knows(&self, peer: &PeerId) -> bool {
        !self.neighbors_of(peer).is_empty()
    }
}

/// Source of time for timestamps, expirations and maintenance periods.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually advanced clock for simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now: AtomicU64::new(start_ms) }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(42);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
