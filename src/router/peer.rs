//! Peer-idle bookkeeping (spec.md §4.3 "Peer idle tracking").

use crate::message::Identity;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks `last_seen` epoch per peer (a remote rank's link identity, or a
/// local module's UUID identity). `idle(peer) = current_epoch - last_seen`.
#[derive(Default)]
pub struct PeerTable {
    epoch: AtomicU64,
    last_seen: DashMap<Identity, u64>,
}

impl PeerTable {
    /// Creates an empty table at epoch 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a frame was just received from `peer`.
    pub fn touch(&self, peer: &Identity) {
        let epoch = self.epoch.load(Ordering::Acquire);
        self.last_seen.insert(peer.clone(), epoch);
    }

    /// Advances the epoch on a periodic heartbeat tick.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// How many epochs have elapsed since `peer` was last seen. A peer never
    /// contacted yet is considered maximally idle.
    #[must_use]
    pub fn idle(&self, peer: &Identity) -> u64 {
        let epoch = self.epoch.load(Ordering::Acquire);
        match self.last_seen.get(peer) {
            Some(last) => epoch.saturating_sub(*last),
            None => u64::MAX,
        }
    }

    /// This rank's own idle count relative to its parent, used to decide
    /// whether to send a keepalive `broker.ping` upstream.
    #[must_use]
    pub fn self_idle(&self, self_identity: &Identity) -> u64 {
        self.idle(self_identity)
    }

    /// Whether any peer has been recorded yet.
    #[must_use]
    pub fn last_seen_any(&self) -> bool {
        !self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_grows_with_epoch_and_resets_on_touch() {
        let table = PeerTable::new();
        let peer = Identity::try_new("rank-1").unwrap();
        assert_eq!(table.idle(&peer), u64::MAX);
        table.touch(&peer);
        assert_eq!(table.idle(&peer), 0);
        table.advance_epoch();
        table.advance_epoch();
        assert_eq!(table.idle(&peer), 2);
        table.touch(&peer);
        assert_eq!(table.idle(&peer), 0);
    }
}
