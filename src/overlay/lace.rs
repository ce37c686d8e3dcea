//! Lace membership: joining, coordinate assignment, peering and repair.

use super::{Effects, NodeState, Phase};
use crate::error::NodeError;
use lace_proto::{Body, Coord, Envelope, NodeId, Stamp};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

impl NodeState {
    /// Start a new lace: take the origin cell and a fresh seed clock.
    pub fn found(&mut self) -> Result<(), NodeError> {
        if self.phase == Phase::Member {
            return Err(NodeError::AlreadyJoined);
        }
        self.coord = Coord::ORIGIN;
        self.lace_max = self.lace_max.max(Coord::ORIGIN);
        self.clock = Some(Stamp::seed());
        self.phase = Phase::Member;
        info!(node = %self.id.short(), coord = %self.coord, "founded lace");
        Ok(())
    }

    /// Ask `targets` for a coordinate. `hello` is repeated every heartbeat
    /// until one of them answers.
    pub fn join(&mut self, targets: &[SocketAddr], fx: &mut Effects) -> Result<(), NodeError> {
        if self.phase == Phase::Member {
            return Err(NodeError::AlreadyJoined);
        }
        if targets.is_empty() {
            return Err(NodeError::NoBootstrap);
        }
        self.phase = Phase::Joining;
        self.join_targets = targets.to_vec();
        info!(node = %self.id.short(), targets = targets.len(), "joining lace");
        self.send_hellos(fx);
        Ok(())
    }

    pub(super) fn send_hellos(&mut self, fx: &mut Effects) {
        let env = self.originate(Body::Hello {
            value: None,
            newlm: None,
        });
        for target in &self.join_targets {
            fx.sends.push((*target, env.clone()));
        }
    }

    /// A newcomer asks us for a coordinate.
    pub(super) fn on_hello(&mut self, joiner: NodeId, src: SocketAddr, fx: &mut Effects) {
        if self.phase != Phase::Member {
            return;
        }
        let Some(assigned) = self.lace_max.next() else {
            warn!(lace_max = %self.lace_max, "lace is full, refusing hello");
            return;
        };
        let Some(clock) = self.clock.as_mut() else {
            return;
        };
        let child = clock.fork();
        self.lace_max = assigned;
        info!(joiner = %joiner.short(), coord = %assigned, "assigned coordinate");

        let mut welcome = self.originate(Body::Hello {
            value: Some(assigned),
            newlm: Some(assigned),
        });
        welcome.clock = Some(child.encode());
        fx.sends.push((src, welcome));
        self.broadcast(Body::NewLaceMax { newlm: assigned }, fx);
    }

    /// Our `hello` was answered with a coordinate and a forked clock.
    pub(super) fn on_welcome(
        &mut self,
        env: &Envelope,
        assigned: Coord,
        newlm: Option<Coord>,
        src: SocketAddr,
        fx: &mut Effects,
    ) {
        if self.phase != Phase::Joining || !assigned.is_assigned() {
            return;
        }
        if !can_follow(&assigned) {
            debug!(peer = %src, coord = %assigned, "welcome assigned the last cell, ignoring");
            return;
        }
        let newlm = newlm.filter(can_follow);
        let clock = match env.clock.as_deref().map(Stamp::decode) {
            Some(Ok(clock)) if clock.is_owner() => clock,
            Some(Err(e)) => {
                debug!(kind = e.kind(), "welcome carried an undecodable clock");
                return;
            }
            _ => {
                debug!(peer = %src, "welcome without an owned clock");
                return;
            }
        };
        self.coord = assigned;
        self.lace_max = self.lace_max.max(assigned).max(newlm.unwrap_or(assigned));
        self.clock = Some(clock);
        self.phase = Phase::Member;
        self.join_targets.clear();
        info!(node = %self.id.short(), coord = %assigned, lace_max = %self.lace_max, "joined lace");

        // The greeter is a temporary peer until compatible peers answer.
        self.add_peer(env.sender(), src, env.sender_coord(), fx);
        self.broadcast(Body::NeedPeer, fx);
    }

    /// A member announced its coordinate.
    pub(super) fn on_needpeer(&mut self, env: &Envelope, src: SocketAddr, fx: &mut Effects) {
        if self.phase != Phase::Member {
            return;
        }
        let sender = env.sender();
        self.flood(env, Some(sender), fx);

        let theirs = env.sender_coord();
        if theirs == self.coord {
            // Exactly one of the two holders gives the cell up: the larger id.
            if self.id > sender {
                self.reconnect_via(src, fx);
            } else {
                warn!(peer = %sender.short(), coord = %theirs, "duplicate coordinate, requesting reconnect");
                self.send(src, Body::Recon, fx);
            }
            return;
        }
        if self.coord.is_compatible(&theirs) {
            self.add_peer(sender, src, theirs, fx);
            let newlm = self.lace_max;
            self.send(src, Body::NewPeer { newlm }, fx);
        }
        self.adopt_lace_max(theirs);
    }

    /// A compatible member accepted us as a peer.
    pub(super) fn on_newpeer(&mut self, env: &Envelope, newlm: Coord, src: SocketAddr, fx: &mut Effects) {
        if self.phase != Phase::Member {
            return;
        }
        let theirs = env.sender_coord();
        self.adopt_lace_max(newlm);
        if theirs == self.coord || !self.coord.is_compatible(&theirs) {
            return;
        }
        self.add_peer(env.sender(), src, theirs, fx);
        self.shed_incompatible(fx);
    }

    pub(super) fn on_newlm(&mut self, env: &Envelope, newlm: Coord, fx: &mut Effects) {
        self.flood(env, Some(env.sender()), fx);
        self.adopt_lace_max(newlm);
    }

    /// The sender holds our coordinate too and keeps it.
    pub(super) fn on_recon(&mut self, env: &Envelope, src: SocketAddr, fx: &mut Effects) {
        if self.phase != Phase::Member || env.sender_coord() != self.coord || env.sender() > self.id {
            debug!(peer = %src, "ignoring stale recon");
            return;
        }
        self.reconnect_via(src, fx);
    }

    /// Give up our coordinate and ask the member at `via` for a new one.
    fn reconnect_via(&mut self, via: SocketAddr, fx: &mut Effects) {
        warn!(node = %self.id.short(), coord = %self.coord, via = %via, "reconnecting after coordinate conflict");
        self.leave_lace(fx);
        self.phase = Phase::Joining;
        self.join_targets = vec![via];
        self.send_hellos(fx);
    }

    pub(super) fn on_bye(&mut self, sender: NodeId, fx: &mut Effects) {
        if self.remove_peer(&sender, fx) {
            info!(peer = %sender.short(), "peer left");
        }
    }

    /// Release our own lock request and drop coordinate, clock and peers.
    /// Grants we hold as a voter stay valid: they are keyed by node id.
    pub(super) fn leave_lace(&mut self, fx: &mut Effects) {
        self.abandon_mutex(fx);
        self.coord = Coord::UNASSIGNED;
        self.clock = None;
        self.peers.clear();
        self.phase = Phase::Unjoined;
    }

    /// Say goodbye to every peer and become unjoined.
    pub fn leave(&mut self, fx: &mut Effects) {
        self.abandon_mutex(fx);
        if self.phase == Phase::Member {
            let env = self.originate(Body::Bye);
            self.flood(&env, None, fx);
        }
        self.leave_lace(fx);
        self.join_targets.clear();
        info!(node = %self.id.short(), "left lace");
    }

    fn adopt_lace_max(&mut self, announced: Coord) {
        if !can_follow(&announced) {
            debug!(coord = %announced, "dropping lace max with no successor");
            return;
        }
        if announced.advances(&self.lace_max) {
            debug!(from = %self.lace_max, to = %announced, "lace max advanced");
            self.lace_max = announced;
        }
    }

    pub(super) fn add_peer(&mut self, id: NodeId, addr: SocketAddr, coord: Coord, fx: &mut Effects) {
        if id == self.id {
            return;
        }
        if self.peers.upsert(id, addr, coord) {
            info!(peer = %id.short(), addr = %addr, coord = %coord, "peer added");
            self.on_peer_added(id, fx);
        }
    }

    pub(super) fn remove_peer(&mut self, id: &NodeId, fx: &mut Effects) -> bool {
        if self.peers.remove(id).is_none() {
            return false;
        }
        debug!(peer = %id.short(), "peer removed");
        self.on_quorum_shrunk(fx);
        true
    }

    /// Drop peers outside our row and column, once at least one is inside.
    pub(super) fn shed_incompatible(&mut self, fx: &mut Effects) {
        if !self.peers.any_compatible(&self.coord) {
            return;
        }
        for id in self.peers.incompatible_with(&self.coord) {
            if self.peers.remove(&id).is_some() {
                debug!(peer = %id.short(), "shed incompatible peer");
            }
        }
        self.on_quorum_shrunk(fx);
    }
}

/// A lace max must leave room for the next joiner.
fn can_follow(coord: &Coord) -> bool {
    coord.next().is_some()
}
