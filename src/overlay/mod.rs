//! Per-node overlay state and message handling.
//!
//! [`NodeState`] is the single exclusively-owned node context: lace
//! coordinates, peer table, dedup windows, causal clock and mutex engine.
//! Handlers mutate it and describe their side effects in [`Effects`];
//! the [`Broadcaster`](crate::Broadcaster) applies those effects once its
//! lock is released, so no I/O or user code ever runs under the lock.

mod housekeeping;
mod lace;
mod mutex;
mod peers;


pub use peers::{PeerEntry, PeerTable};

use crate::dedup::DedupWindow;
use crate::error::NodeError;
use crate::maekawa::{AcquireCallback, MaekawaEngine};
use crate::metrics;
use lace_proto::{Body, Coord, Envelope, NodeId, Stamp};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Membership phase of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not part of any lace.
    Unjoined,
    /// `hello` sent, waiting for a coordinate.
    Joining,
    /// Holds a coordinate and a clock.
    Member,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unjoined => "unjoined",
            Self::Joining => "joining",
            Self::Member => "member",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for a node's overlay state.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Message stamps remembered for duplicate suppression.
    pub dedup_capacity: usize,
    /// Recently heard-from addresses kept for re-bootstrapping.
    pub address_memory: usize,
    /// Heartbeats a peer may miss before it is dropped.
    pub max_missed_pings: u32,
    /// Addresses contacted when joining or when left without peers.
    pub bootstrap: Vec<SocketAddr>,
    /// Reply address stamped on originated messages.
    pub advertise: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dedup_capacity: 2500,
            address_memory: 50,
            max_missed_pings: 5,
            bootstrap: Vec::new(),
            advertise: None,
        }
    }
}

/// An application payload to hand to the notifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub data: Value,
    pub from: NodeId,
    /// Where a reply to this payload goes.
    pub reply_to: SocketAddr,
}

/// Side effects produced by a handler, applied after the node lock is released.
#[derive(Default)]
pub struct Effects {
    /// Envelopes to serialise and send, in order.
    pub sends: Vec<(SocketAddr, Envelope)>,
    /// Payloads for subscribed hooks.
    pub deliveries: Vec<Delivery>,
    /// Acquisition callbacks whose lock is now held.
    pub granted: Vec<AcquireCallback>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.deliveries.is_empty() && self.granted.is_empty()
    }
}

impl fmt::Debug for Effects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effects")
            .field("sends", &self.sends)
            .field("deliveries", &self.deliveries)
            .field("granted", &self.granted.len())
            .finish()
    }
}

/// Everything one node knows.
pub struct NodeState {
    id: NodeId,
    coord: Coord,
    lace_max: Coord,
    phase: Phase,
    peers: PeerTable,
    seen: DedupWindow<u128>,
    recent: DedupWindow<SocketAddr>,
    clock: Option<Stamp>,
    mutex: MaekawaEngine,
    /// Last known reply address of every node heard from, for mutex traffic
    /// addressed to nodes that are not (or no longer) peers.
    directory: HashMap<NodeId, SocketAddr>,
    /// Addresses `hello` goes to while joining.
    join_targets: Vec<SocketAddr>,
    settings: Settings,
}

impl NodeState {
    pub fn new(id: NodeId, settings: Settings) -> Self {
        Self {
            id,
            coord: Coord::UNASSIGNED,
            lace_max: Coord::UNASSIGNED,
            phase: Phase::Unjoined,
            peers: PeerTable::new(),
            seen: DedupWindow::new(settings.dedup_capacity),
            recent: DedupWindow::new(settings.address_memory),
            clock: None,
            mutex: MaekawaEngine::new(id),
            directory: HashMap::new(),
            join_targets: Vec::new(),
            settings,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn coord(&self) -> Coord {
        self.coord
    }

    pub fn lace_max(&self) -> Coord {
        self.lace_max
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn clock(&self) -> Option<&Stamp> {
        self.clock.as_ref()
    }

    pub fn mutex(&self) -> &MaekawaEngine {
        &self.mutex
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Addresses recently heard from, oldest first.
    pub fn recent_addrs(&self) -> Vec<SocketAddr> {
        self.recent.snapshot()
    }

    /// Build an envelope originated by this node.
    ///
    /// Records a clock event, attaches the clock snapshot and the advertised
    /// reply address, and marks the stamp as seen so echoes are dropped.
    fn originate(&mut self, body: Body) -> Envelope {
        let mut env = Envelope::new(body, self.id, self.coord);
        if let Some(clock) = self.clock.as_mut() {
            clock.event();
            env.clock = Some(clock.peek().encode());
        }
        env.src = self.settings.advertise.map(Into::into);
        self.seen.insert(env.stamp);
        env
    }

    /// Originate `body` and send it to one address.
    fn send(&mut self, to: SocketAddr, body: Body, fx: &mut Effects) {
        let env = self.originate(body);
        fx.sends.push((to, env));
    }

    /// Send an already-built envelope to every peer except `skip`.
    fn flood(&self, env: &Envelope, skip: Option<NodeId>, fx: &mut Effects) {
        let before = fx.sends.len();
        for (id, peer) in self.peers.iter() {
            if Some(*id) != skip {
                fx.sends.push((peer.addr, env.clone()));
            }
        }
        metrics::record_fanout(fx.sends.len() - before);
    }

    /// Originate `body` and flood it to every peer.
    fn broadcast(&mut self, body: Body, fx: &mut Effects) {
        let env = self.originate(body);
        self.flood(&env, None, fx);
    }

    /// Process one decoded inbound envelope that arrived from `from`.
    pub fn receive(&mut self, mut env: Envelope, from: SocketAddr, fx: &mut Effects) {
        let src: SocketAddr = match env.src {
            Some(src) => src.into(),
            None => {
                env.src = Some(from.into());
                from
            }
        };
        if self.seen.check_and_insert(env.stamp) {
            trace!(kind = env.body.kind(), stamp = env.stamp, "duplicate dropped");
            metrics::record_duplicate();
            return;
        }
        metrics::record_received(env.body.kind());
        let sender = env.sender();
        if sender == self.id {
            return;
        }
        self.recent.insert(src);
        self.directory.insert(sender, src);
        // Relayed traffic proves nothing about our own link to the originator.
        if !env.body.is_flooded() {
            self.peers.touch(&sender, env.sender_coord());
        }
        self.merge_clock(&env);

        match env.body.clone() {
            Body::Hello { value: None, .. } => self.on_hello(sender, src, fx),
            Body::Hello {
                value: Some(assigned),
                newlm,
            } => self.on_welcome(&env, assigned, newlm, src, fx),
            Body::NeedPeer => self.on_needpeer(&env, src, fx),
            Body::NewPeer { newlm } => self.on_newpeer(&env, newlm, src, fx),
            Body::NewLaceMax { newlm } => self.on_newlm(&env, newlm, fx),
            Body::Recon => self.on_recon(&env, src, fx),
            Body::Data { data } => {
                self.flood(&env, Some(sender), fx);
                fx.deliveries.push(Delivery {
                    data,
                    from: sender,
                    reply_to: src,
                });
            }
            Body::OnceData { data } => fx.deliveries.push(Delivery {
                data,
                from: sender,
                reply_to: src,
            }),
            Body::Maekawa { maekawa, seq } => self.on_mutex_message(sender, maekawa, seq, fx),
            Body::Ping => self.send(src, Body::Pong, fx),
            Body::Pong => {}
            Body::Bye => self.on_bye(sender, fx),
            Body::Unknown => debug!(peer = %src, "ignoring unknown message type"),
        }
    }

    /// Join the clock carried by an inbound message into ours.
    fn merge_clock(&mut self, env: &Envelope) {
        let (Some(mine), Some(encoded)) = (self.clock.as_mut(), env.clock.as_deref()) else {
            return;
        };
        match Stamp::decode(encoded) {
            // Owned stamps are only ever handed out in a `hello` reply.
            Ok(theirs) if !theirs.is_owner() => mine.join(&theirs),
            Ok(_) => {}
            Err(e) => debug!(kind = e.kind(), "ignoring undecodable clock"),
        }
    }

    /// Originate an application broadcast.
    pub fn broadcast_data(&mut self, data: Value, fx: &mut Effects) -> Result<(), NodeError> {
        if self.phase != Phase::Member {
            return Err(NodeError::NotJoined);
        }
        self.broadcast(Body::Data { data }, fx);
        Ok(())
    }

    /// Send an application payload to one peer chosen at random.
    pub fn send_one(&mut self, data: Value, fx: &mut Effects) -> Result<NodeId, NodeError> {
        use rand::seq::IteratorRandom;

        let Some((id, addr)) = self
            .peers
            .iter()
            .map(|(id, peer)| (*id, peer.addr))
            .choose(&mut rand::thread_rng())
        else {
            return Err(NodeError::NoPeers);
        };
        self.send(addr, Body::OnceData { data }, fx);
        Ok(id)
    }

    /// Answer a delivered payload directly.
    pub fn reply(&mut self, to: SocketAddr, data: Value, fx: &mut Effects) {
        self.send(to, Body::OnceData { data }, fx);
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("id", &self.id)
            .field("coord", &self.coord)
            .field("lace_max", &self.lace_max)
            .field("phase", &self.phase)
            .field("peers", &self.peers.len())
            .field("mutex", &self.mutex)
            .finish_non_exhaustive()
    }
}
