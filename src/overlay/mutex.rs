//! Wiring between the lace and the Maekawa engine.
//!
//! The quorum is the current peer set plus this node. Messages the engine
//! addresses to ourselves are looped back in place; the rest go out as
//! `maekawa` envelopes.

use super::{Effects, NodeState, Phase};
use crate::error::NodeError;
use crate::maekawa::{AcquireCallback, MutexSend};
use crate::metrics::{self, MutexEvent};
use lace_proto::{Body, MaekawaKind, NodeId};
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use tracing::debug;

impl NodeState {
    /// Every node whose grant we need: our peers and ourselves.
    pub fn quorum(&self) -> Vec<NodeId> {
        let mut quorum: Vec<NodeId> = self.peers.ids().collect();
        quorum.push(self.id);
        quorum
    }

    /// Ask the quorum for the cluster-wide lock. `on_granted` runs once it is held.
    pub fn acquire_mutex(
        &mut self,
        on_granted: Option<AcquireCallback>,
        fx: &mut Effects,
    ) -> Result<u64, NodeError> {
        if self.phase != Phase::Member {
            return Err(NodeError::NotJoined);
        }
        let seq = self.mutex.acquire(on_granted).map_err(|_| NodeError::MutexBusy)?;
        metrics::record_mutex(MutexEvent::Acquire);
        let requests = self.fan_out(MaekawaKind::Request, seq);
        for request in &requests {
            self.mutex.note_asked(request.to);
        }
        self.route_mutex(requests, fx);
        Ok(seq)
    }

    /// Release the lock, or cancel an acquisition that has not completed.
    ///
    /// The release goes to everyone asked, not just the current peers: a
    /// voter that granted and then dropped out of the peer set still holds
    /// our ticket. Those are reached through the directory and sent the
    /// release again if they become peers later.
    pub fn release_mutex(&mut self, fx: &mut Effects) -> Result<u64, NodeError> {
        let seq = self.mutex.release().ok_or(NodeError::MutexNotHeld)?;
        metrics::record_mutex(MutexEvent::Release);
        let mut targets: BTreeSet<NodeId> = self.mutex.asked().copied().collect();
        targets.extend(self.quorum());
        for node in &targets {
            if *node != self.id && !self.peers.contains(node) {
                self.mutex.owe_release(*node, seq);
            }
        }
        let releases = targets
            .into_iter()
            .map(|to| MutexSend {
                to,
                kind: MaekawaKind::Release,
                seq,
            })
            .collect();
        self.route_mutex(releases, fx);
        Ok(seq)
    }

    /// Release whatever is held or outstanding; a no-op otherwise.
    pub(super) fn abandon_mutex(&mut self, fx: &mut Effects) {
        if self.release_mutex(fx).is_ok() {
            debug!(node = %self.id.short(), "abandoned mutex");
        }
    }

    pub(super) fn on_mutex_message(&mut self, from: NodeId, kind: MaekawaKind, seq: u64, fx: &mut Effects) {
        let mut out = Vec::new();
        self.mutex.handle(from, kind, seq, &mut out);
        self.route_mutex(out, fx);
    }

    /// A new peer joins the quorum of an acquisition in flight.
    /// Releases it may have missed while away are sent again.
    pub(super) fn on_peer_added(&mut self, peer: NodeId, fx: &mut Effects) {
        let mut sends: Vec<MutexSend> = self
            .mutex
            .take_owed(&peer)
            .into_iter()
            .map(|seq| MutexSend {
                to: peer,
                kind: MaekawaKind::Release,
                seq,
            })
            .collect();
        if !sends.is_empty() {
            debug!(peer = %peer.short(), releases = sends.len(), "re-sending owed releases");
        }
        if let Some(seq) = self.mutex.outstanding() {
            self.mutex.note_asked(peer);
            sends.push(MutexSend {
                to: peer,
                kind: MaekawaKind::Request,
                seq,
            });
        }
        if !sends.is_empty() {
            self.route_mutex(sends, fx);
        }
    }

    /// Fewer grants may now be enough.
    pub(super) fn on_quorum_shrunk(&mut self, fx: &mut Effects) {
        self.check_mutex(fx);
    }

    fn fan_out(&self, kind: MaekawaKind, seq: u64) -> Vec<MutexSend> {
        self.quorum()
            .into_iter()
            .map(|to| MutexSend { to, kind, seq })
            .collect()
    }

    fn addr_of(&self, node: &NodeId) -> Option<SocketAddr> {
        self.peers
            .get(node)
            .map(|peer| peer.addr)
            .or_else(|| self.directory.get(node).copied())
    }

    fn route_mutex(&mut self, sends: Vec<MutexSend>, fx: &mut Effects) {
        let mut work: VecDeque<MutexSend> = sends.into();
        while let Some(send) = work.pop_front() {
            if send.to == self.id {
                let mut out = Vec::new();
                self.mutex.handle(self.id, send.kind, send.seq, &mut out);
                work.extend(out);
                continue;
            }
            match self.addr_of(&send.to) {
                Some(addr) => self.send(
                    addr,
                    Body::Maekawa {
                        maekawa: send.kind,
                        seq: send.seq,
                    },
                    fx,
                ),
                None => debug!(to = %send.to.short(), kind = send.kind.as_str(), "no route for mutex message"),
            }
        }
        self.check_mutex(fx);
    }

    fn check_mutex(&mut self, fx: &mut Effects) {
        let quorum = self.quorum();
        if let Some(granted) = self.mutex.try_complete(&quorum) {
            debug!(node = %self.id.short(), quorum = quorum.len(), "cluster lock held");
            metrics::record_mutex(MutexEvent::Granted);
            fx.granted.extend(granted);
        }
    }
}
