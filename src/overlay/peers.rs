//! The local peer table.

use lace_proto::{Coord, NodeId};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// What a node knows about one of its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    /// Address messages for this peer are sent to.
    pub addr: SocketAddr,
    /// The peer's lace coordinate as last announced.
    pub coord: Coord,
    /// Heartbeats since the peer was last heard from.
    pub missed: u32,
}

/// Peers keyed by node id, iterated in id order.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<NodeId, PeerEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. Returns true if it was not already present.
    pub fn upsert(&mut self, id: NodeId, addr: SocketAddr, coord: Coord) -> bool {
        match self.peers.get_mut(&id) {
            Some(entry) => {
                entry.addr = addr;
                entry.coord = coord;
                entry.missed = 0;
                false
            }
            None => {
                self.peers.insert(id, PeerEntry { addr, coord, missed: 0 });
                true
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PeerEntry> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerEntry> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Mark a peer as alive, refreshing its coordinate if one was announced.
    pub fn touch(&mut self, id: &NodeId, coord: Coord) {
        if let Some(entry) = self.peers.get_mut(id) {
            entry.missed = 0;
            if coord.is_assigned() {
                entry.coord = coord;
            }
        }
    }

    /// Count one more missed heartbeat for every peer and return the ids of
    /// those that have now missed more than `limit`.
    pub fn sweep(&mut self, limit: u32) -> Vec<NodeId> {
        self.peers
            .iter_mut()
            .filter_map(|(id, entry)| {
                entry.missed = entry.missed.saturating_add(1);
                (entry.missed > limit).then_some(*id)
            })
            .collect()
    }

    /// Ids of peers whose coordinate is not compatible with `own`.
    pub fn incompatible_with(&self, own: &Coord) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, entry)| !own.is_compatible(&entry.coord))
            .map(|(id, _)| *id)
            .collect()
    }

    /// True if any peer shares a row or column with `own`.
    pub fn any_compatible(&self, own: &Coord) -> bool {
        self.peers.values().any(|entry| own.is_compatible(&entry.coord))
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.peers.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerEntry)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
