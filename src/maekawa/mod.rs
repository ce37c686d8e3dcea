//! Maekawa distributed mutual exclusion.
//!
//! Every node plays two roles:
//!
//! - **voter**: holds a single grant and hands it to one requester at a time,
//!   queueing the rest by priority.
//! - **requester**: asks every member of its quorum (its peers plus itself)
//!   for their grant and enters the critical section once all have answered.
//!
//! Priority is the total order over `(seq, node id)`, lower first. A voter
//! whose grant is held by a lower-priority requester sends `inquire`; the
//! requester gives the grant back with `yield` once it knows it cannot win
//! (it has seen a `fail`). This keeps the protocol deadlock-free.
//!
//! The engine is pure state: handlers append [`MutexSend`]s to an output
//! buffer and the caller routes them (to itself by loopback, to peers over
//! the transport).

use lace_proto::{MaekawaKind, NodeId};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{debug, trace};


/// Invoked once the cluster-wide lock is held.
pub type AcquireCallback = Box<dyn FnOnce() + Send + 'static>;

/// A request's place in line. Lower sorts first and wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket {
    /// Request sequence number.
    pub seq: u64,
    /// Requesting node.
    pub node: NodeId,
}

impl Ticket {
    /// Create a ticket.
    pub fn new(seq: u64, node: NodeId) -> Self {
        Self { seq, node }
    }
}

/// An outbound mutual-exclusion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexSend {
    /// Destination node (may be ourselves).
    pub to: NodeId,
    /// Message sub-type.
    pub kind: MaekawaKind,
    /// Sequence number of the request the message is about.
    pub seq: u64,
}

/// Returned by [`MaekawaEngine::acquire`] when a request is already outstanding or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Per-node mutual-exclusion state.
pub struct MaekawaEngine {
    me: NodeId,
    /// Highest sequence number observed; the next request uses one more.
    lamport: u64,

    // Voter side.
    grant: Option<Ticket>,
    queue: BTreeSet<Ticket>,
    inquiry_sent: bool,
    retired: BTreeSet<Ticket>,

    // Requester side.
    request: Option<u64>,
    held: bool,
    granted_by: HashSet<NodeId>,
    failed_by: HashSet<NodeId>,
    yielded_to: HashSet<NodeId>,
    deferred: HashSet<NodeId>,
    on_granted: Option<AcquireCallback>,
    /// Everyone sent a `request` for the current (or last) acquisition.
    asked: BTreeSet<NodeId>,
    /// Releases that may not have reached a voter which had left our peer set.
    owed: BTreeSet<(NodeId, u64)>,
}

/// Released tickets remembered so a request overtaken by its own release is not granted.
const RETIRED_LIMIT: usize = 256;

/// Undelivered releases remembered per node.
const OWED_LIMIT: usize = 256;

impl MaekawaEngine {
    /// Create the engine for node `me`.
    pub fn new(me: NodeId) -> Self {
        Self {
            me,
            lamport: 0,
            grant: None,
            queue: BTreeSet::new(),
            inquiry_sent: false,
            retired: BTreeSet::new(),
            request: None,
            held: false,
            granted_by: HashSet::new(),
            failed_by: HashSet::new(),
            yielded_to: HashSet::new(),
            deferred: HashSet::new(),
            on_granted: None,
            asked: BTreeSet::new(),
            owed: BTreeSet::new(),
        }
    }

    /// This node's id.
    pub fn me(&self) -> NodeId {
        self.me
    }

    /// True while this node holds the cluster-wide lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Sequence number of the outstanding (not yet held) request.
    pub fn outstanding(&self) -> Option<u64> {
        if self.held { None } else { self.request }
    }

    /// Ticket this node's grant is currently given to.
    pub fn granted_to(&self) -> Option<Ticket> {
        self.grant
    }

    /// Requests waiting for this node's grant.
    pub fn queued(&self) -> impl Iterator<Item = &Ticket> {
        self.queue.iter()
    }

    /// Start an acquisition. Returns the sequence number to send in
    /// `request` messages to every quorum member, including ourselves.
    pub fn acquire(&mut self, on_granted: Option<AcquireCallback>) -> Result<u64, Busy> {
        if self.request.is_some() {
            return Err(Busy);
        }
        self.lamport += 1;
        let seq = self.lamport;
        self.request = Some(seq);
        self.held = false;
        self.granted_by.clear();
        self.failed_by.clear();
        self.yielded_to.clear();
        self.deferred.clear();
        self.asked.clear();
        self.on_granted = on_granted;
        debug!(node = %self.me.short(), seq, "mutex requested");
        Ok(seq)
    }

    /// Release the lock, or abandon an acquisition still in flight.
    ///
    /// Returns the sequence number to send in `release` messages to every
    /// quorum member, or `None` if nothing was outstanding. Any pending
    /// callback is dropped without being called.
    pub fn release(&mut self) -> Option<u64> {
        let seq = self.request.take()?;
        debug!(node = %self.me.short(), seq, held = self.held, "mutex released");
        self.held = false;
        self.on_granted = None;
        self.granted_by.clear();
        self.failed_by.clear();
        self.yielded_to.clear();
        self.deferred.clear();
        Some(seq)
    }

    /// Record that `node` was sent a `request` for the outstanding acquisition.
    pub fn note_asked(&mut self, node: NodeId) {
        if self.request.is_some() {
            self.asked.insert(node);
        }
    }

    /// Nodes asked during the current or most recent acquisition. A voter
    /// that granted may since have left the quorum; it still needs the release.
    pub fn asked(&self) -> impl Iterator<Item = &NodeId> {
        self.asked.iter()
    }

    /// Remember a release for `node` that could not be confirmed delivered.
    pub fn owe_release(&mut self, node: NodeId, seq: u64) {
        self.owed.insert((node, seq));
        while self.owed.len() > OWED_LIMIT {
            self.owed.pop_first();
        }
    }

    /// Take the releases still owed to `node`, oldest first.
    pub fn take_owed(&mut self, node: &NodeId) -> Vec<u64> {
        let owed: Vec<u64> = self
            .owed
            .range((*node, 0)..=(*node, u64::MAX))
            .map(|(_, seq)| *seq)
            .collect();
        for seq in &owed {
            self.owed.remove(&(*node, *seq));
        }
        owed
    }

    /// Check whether every quorum member has granted our request. If so the
    /// lock is now held and the acquisition callback is returned (at most
    /// once per acquisition).
    pub fn try_complete<'a>(
        &mut self,
        quorum: impl IntoIterator<Item = &'a NodeId>,
    ) -> Option<Option<AcquireCallback>> {
        if self.held || self.request.is_none() {
            return None;
        }
        let mut quorum = quorum.into_iter();
        if !quorum.all(|n| self.granted_by.contains(n)) || !self.granted_by.contains(&self.me) {
            return None;
        }
        self.held = true;
        self.failed_by.clear();
        self.yielded_to.clear();
        self.deferred.clear();
        debug!(node = %self.me.short(), seq = ?self.request, "mutex acquired");
        Some(self.on_granted.take())
    }

    /// Handle one incoming message from `from`.
    pub fn handle(&mut self, from: NodeId, kind: MaekawaKind, seq: u64, out: &mut Vec<MutexSend>) {
        trace!(node = %self.me.short(), from = %from.short(), kind = kind.as_str(), seq, "mutex message");
        match kind {
            MaekawaKind::Request => self.on_request(Ticket::new(seq, from), out),
            MaekawaKind::Grant => self.on_grant(from, seq),
            MaekawaKind::Inquire => self.on_inquire(from, seq, out),
            MaekawaKind::Fail => self.on_fail(from, seq, out),
            MaekawaKind::Yield => self.on_yield(Ticket::new(seq, from), out),
            MaekawaKind::Release => self.on_release(Ticket::new(seq, from), out),
        }
    }

    fn send(out: &mut Vec<MutexSend>, to: NodeId, kind: MaekawaKind, seq: u64) {
        out.push(MutexSend { to, kind, seq });
    }

    fn grant_to(&mut self, ticket: Ticket, out: &mut Vec<MutexSend>) {
        self.grant = Some(ticket);
        self.inquiry_sent = false;
        Self::send(out, ticket.node, MaekawaKind::Grant, ticket.seq);
    }

    fn on_request(&mut self, ticket: Ticket, out: &mut Vec<MutexSend>) {
        self.lamport = self.lamport.max(ticket.seq);
        if self.retired.contains(&ticket) {
            return;
        }
        let Some(current) = self.grant else {
            self.grant_to(ticket, out);
            return;
        };
        if current == ticket {
            Self::send(out, ticket.node, MaekawaKind::Grant, ticket.seq);
            return;
        }

        let head = self.queue.first().copied();
        if !self.queue.insert(ticket) {
            return;
        }
        let beaten = current < ticket || head.is_some_and(|h| h < ticket);
        if beaten {
            Self::send(out, ticket.node, MaekawaKind::Fail, ticket.seq);
            return;
        }
        // The new request is first in line: whoever was first is not any more.
        if let Some(displaced) = head {
            Self::send(out, displaced.node, MaekawaKind::Fail, displaced.seq);
        }
        if !self.inquiry_sent {
            self.inquiry_sent = true;
            Self::send(out, current.node, MaekawaKind::Inquire, current.seq);
        }
    }

    fn on_grant(&mut self, from: NodeId, seq: u64) {
        if self.held || self.request != Some(seq) {
            return;
        }
        self.granted_by.insert(from);
        self.failed_by.remove(&from);
        self.yielded_to.remove(&from);
    }

    fn on_inquire(&mut self, from: NodeId, seq: u64, out: &mut Vec<MutexSend>) {
        if self.held || self.request != Some(seq) {
            return;
        }
        if self.failed_by.is_empty() && self.yielded_to.is_empty() {
            self.deferred.insert(from);
            return;
        }
        self.yield_to(from, seq, out);
    }

    fn on_fail(&mut self, from: NodeId, seq: u64, out: &mut Vec<MutexSend>) {
        if self.held || self.request != Some(seq) {
            return;
        }
        let deferred: Vec<NodeId> = self.deferred.drain().collect();
        for voter in deferred {
            self.yield_to(voter, seq, out);
        }
        self.failed_by.insert(from);
    }

    fn yield_to(&mut self, voter: NodeId, seq: u64, out: &mut Vec<MutexSend>) {
        self.granted_by.remove(&voter);
        self.yielded_to.insert(voter);
        Self::send(out, voter, MaekawaKind::Yield, seq);
    }

    fn on_yield(&mut self, ticket: Ticket, out: &mut Vec<MutexSend>) {
        if self.grant != Some(ticket) {
            return;
        }
        self.queue.insert(ticket);
        if let Some(next) = self.queue.pop_first() {
            self.grant_to(next, out);
        }
    }

    fn on_release(&mut self, ticket: Ticket, out: &mut Vec<MutexSend>) {
        self.queue.remove(&ticket);
        self.retire(ticket);
        if self.grant != Some(ticket) {
            return;
        }
        self.grant = None;
        self.inquiry_sent = false;
        let Some(next) = self.queue.pop_first() else {
            return;
        };
        self.grant_to(next, out);
        // Anyone still waiting may hold a deferred inquiry from a voter that
        // will never ask again; tell them they are not next.
        for waiting in &self.queue {
            Self::send(out, waiting.node, MaekawaKind::Fail, waiting.seq);
        }
    }

    fn retire(&mut self, ticket: Ticket) {
        self.retired.insert(ticket);
        while self.retired.len() > RETIRED_LIMIT {
            self.retired.pop_first();
        }
    }
}

impl fmt::Debug for MaekawaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaekawaEngine")
            .field("me", &self.me)
            .field("lamport", &self.lamport)
            .field("grant", &self.grant)
            .field("queue", &self.queue)
            .field("request", &self.request)
            .field("held", &self.held)
            .field("granted_by", &self.granted_by)
            .field("failed_by", &self.failed_by)
            .field("deferred", &self.deferred)
            .field("owed", &self.owed.len())
            .finish_non_exhaustive()
    }
}
