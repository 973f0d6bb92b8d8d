//! Dandelion++ stem routing
//!
//! Each routing epoch picks a few random next hops. Every inbound peer is
//! mapped to one of them and keeps that mapping until the next refresh, so
//! a stem path through this node is stable for the epoch.

use lambdadelta_net::PeerId;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Stem destinations and inbound-to-destination mappings
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local: PeerId,
    max_destinations: usize,
    peers: BTreeSet<PeerId>,
    destinations: Vec<PeerId>,
    /// `None` is the route for events we originate
    routes: HashMap<Option<PeerId>, PeerId>,
}

impl RoutingTable {
    pub fn new(local: PeerId, max_destinations: usize) -> Self {
        Self {
            local,
            max_destinations,
            peers: BTreeSet::new(),
            destinations: Vec::new(),
            routes: HashMap::new(),
        }
    }

    /// Replace the peer set, keeping every mapping whose ends are still present
    pub fn update_peers(&mut self, peers: impl IntoIterator<Item = PeerId>) {
        let local = self.local;
        self.peers = peers.into_iter().filter(|p| *p != local).collect();
        self.destinations.retain(|d| self.peers.contains(d));
        self.fill_destinations();
        self.routes.retain(|inbound, dest| {
            self.destinations.contains(dest) && inbound.map_or(true, |p| self.peers.contains(&p))
        });
    }

    /// Pick new destinations and forget all mappings
    pub fn refresh(&mut self) {
        self.destinations.clear();
        self.routes.clear();
        self.fill_destinations();
        debug!("Routing table refreshed: {} destinations", self.destinations.len());
    }

    fn fill_destinations(&mut self) {
        let missing = self.max_destinations.saturating_sub(self.destinations.len());
        if missing == 0 {
            return;
        }
        let mut candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| !self.destinations.contains(p))
            .copied()
            .collect();
        candidates.shuffle(&mut thread_rng());
        self.destinations.extend(candidates.into_iter().take(missing));
    }

    /// Next hop for an event that arrived from `inbound`, never `inbound` itself
    pub fn get_destination(&mut self, inbound: Option<PeerId>) -> Option<PeerId> {
        if let Some(dest) = self.routes.get(&inbound) {
            return Some(*dest);
        }

        let eligible = |p: &&PeerId| Some(**p) != inbound && **p != self.local;
        let mut candidates: Vec<PeerId> = self.destinations.iter().filter(eligible).copied().collect();
        if candidates.is_empty() {
            // Every destination is the sender: fall back to any other peer.
            candidates = self.peers.iter().filter(eligible).copied().collect();
        }
        let dest = *candidates.choose(&mut thread_rng())?;
        self.routes.insert(inbound, dest);
        Some(dest)
    }

    /// Drop a peer that failed, reassigning only the routes through it
    pub fn remove_peer(&mut self, peer: &PeerId) {
        let remaining: Vec<PeerId> = self.peers.iter().filter(|p| *p != peer).copied().collect();
        self.update_peers(remaining);
    }

    pub fn destinations(&self) -> &[PeerId] {
        &self.destinations
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
