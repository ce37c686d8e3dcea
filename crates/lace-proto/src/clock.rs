//! Interval tree clocks for causal ordering between lace members.
//!
//! A [`Stamp`] pairs an *id tree* (the slice of the identity space this
//! member owns) with an *event tree* (what the member has seen). Stamps can be
//! forked when a member greets a newcomer and joined when knowledge flows
//! back, so no global registry of member ids is needed.
//!
//! - `fork`: split ownership, both halves record a fresh event.
//! - `peek`: an anonymous copy (no id) suitable for attaching to a message.
//! - `join`: merge another stamp's knowledge (and ownership, if any).
//! - `leq`: happens-before-or-equal.

use crate::error::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Ownership tree. `Leaf(false)` owns nothing, `Leaf(true)` owns the whole
/// interval, and a node splits the interval into halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Id {
    Leaf(bool),
    Node(Box<Id>, Box<Id>),
}

/// Event tree. A node's value is a base added to both children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Event {
    Leaf(u64),
    Node(u64, Box<Event>, Box<Event>),
}

const ZERO: Id = Id::Leaf(false);
const ONE: Id = Id::Leaf(true);

impl Id {
    fn node(l: Id, r: Id) -> Id {
        match (&l, &r) {
            (Id::Leaf(a), Id::Leaf(b)) if a == b => Id::Leaf(*a),
            _ => Id::Node(Box::new(l), Box::new(r)),
        }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Id::Leaf(false))
    }

    fn split(&self) -> (Id, Id) {
        match self {
            Id::Leaf(false) => (ZERO, ZERO),
            Id::Leaf(true) => (Id::node(ONE, ZERO), Id::node(ZERO, ONE)),
            Id::Node(l, r) if l.is_zero() => {
                let (r1, r2) = r.split();
                (Id::node(ZERO, r1), Id::node(ZERO, r2))
            }
            Id::Node(l, r) if r.is_zero() => {
                let (l1, l2) = l.split();
                (Id::node(l1, ZERO), Id::node(l2, ZERO))
            }
            Id::Node(l, r) => (Id::node((**l).clone(), ZERO), Id::node(ZERO, (**r).clone())),
        }
    }

    fn sum(&self, other: &Id) -> Id {
        match (self, other) {
            (Id::Leaf(false), i) | (i, Id::Leaf(false)) => i.clone(),
            (Id::Node(l1, r1), Id::Node(l2, r2)) => Id::node(l1.sum(l2), r1.sum(r2)),
            // Overlapping ownership cannot arise from fork; collapse to full.
            _ => ONE,
        }
    }
}

impl Event {
    fn base(&self) -> u64 {
        match self {
            Event::Leaf(n) | Event::Node(n, _, _) => *n,
        }
    }

    fn min(&self) -> u64 {
        match self {
            Event::Leaf(n) => *n,
            Event::Node(n, l, r) => n.saturating_add(l.min().min(r.min())),
        }
    }

    fn max(&self) -> u64 {
        match self {
            Event::Leaf(n) => *n,
            Event::Node(n, l, r) => n.saturating_add(l.max().max(r.max())),
        }
    }

    fn lift(&self, m: u64) -> Event {
        match self {
            Event::Leaf(n) => Event::Leaf(n.saturating_add(m)),
            Event::Node(n, l, r) => Event::Node(n.saturating_add(m), l.clone(), r.clone()),
        }
    }

    fn sink(&self, m: u64) -> Event {
        match self {
            Event::Leaf(n) => Event::Leaf(n - m),
            Event::Node(n, l, r) => Event::Node(n - m, l.clone(), r.clone()),
        }
    }

    /// Build a normalised node. Children are sunk by the smaller base so
    /// their bases never underflow.
    fn node(n: u64, l: Event, r: Event) -> Event {
        match (&l, &r) {
            (Event::Leaf(a), Event::Leaf(b)) if a == b => Event::Leaf(n.saturating_add(*a)),
            _ => {
                let m = l.base().min(r.base());
                Event::Node(n.saturating_add(m), Box::new(l.sink(m)), Box::new(r.sink(m)))
            }
        }
    }

    fn leq(&self, other: &Event) -> bool {
        match (self, other) {
            (Event::Leaf(n1), _) => *n1 <= other.base(),
            (Event::Node(n1, l1, r1), Event::Leaf(n2)) => {
                n1 <= n2
                    && l1.lift(*n1).leq(&Event::Leaf(*n2))
                    && r1.lift(*n1).leq(&Event::Leaf(*n2))
            }
            (Event::Node(n1, l1, r1), Event::Node(n2, l2, r2)) => {
                n1 <= n2 && l1.lift(*n1).leq(&l2.lift(*n2)) && r1.lift(*n1).leq(&r2.lift(*n2))
            }
        }
    }

    fn join(&self, other: &Event) -> Event {
        match (self, other) {
            (Event::Leaf(a), Event::Leaf(b)) => Event::Leaf(*a.max(b)),
            (Event::Leaf(n), node @ Event::Node(..)) => {
                Event::Node(*n, Box::new(Event::Leaf(0)), Box::new(Event::Leaf(0))).join(node)
            }
            (node @ Event::Node(..), Event::Leaf(n)) => {
                node.join(&Event::Node(*n, Box::new(Event::Leaf(0)), Box::new(Event::Leaf(0))))
            }
            (Event::Node(n1, ..), Event::Node(n2, ..)) if n1 > n2 => other.join(self),
            (Event::Node(n1, l1, r1), Event::Node(n2, l2, r2)) => {
                let d = n2 - n1;
                Event::node(*n1, l1.join(&l2.lift(d)), r1.join(&r2.lift(d)))
            }
        }
    }

    /// Inflate the event tree as far as owned ids allow without growing it.
    fn fill(&self, id: &Id) -> Event {
        match (id, self) {
            (Id::Leaf(false), e) => e.clone(),
            (Id::Leaf(true), e) => Event::Leaf(e.max()),
            (_, Event::Leaf(n)) => Event::Leaf(*n),
            (Id::Node(il, ir), Event::Node(n, el, er)) => {
                if matches!(**il, Id::Leaf(true)) {
                    let er = er.fill(ir);
                    let left = Event::Leaf(el.max().max(er.min()));
                    Event::node(*n, left, er)
                } else if matches!(**ir, Id::Leaf(true)) {
                    let el = el.fill(il);
                    let right = Event::Leaf(er.max().max(el.min()));
                    Event::node(*n, el, right)
                } else {
                    Event::node(*n, el.fill(il), er.fill(ir))
                }
            }
        }
    }

    /// Grow the event tree at the cheapest owned position.
    ///
    /// Returns `None` when `id` owns nothing.
    fn grow(&self, id: &Id) -> Option<(Event, u64)> {
        const EXPAND_COST: u64 = 1 << 20;
        match (id, self) {
            (Id::Leaf(false), _) => None,
            (Id::Leaf(true), Event::Leaf(n)) => Some((Event::Leaf(n.saturating_add(1)), 0)),
            (_, Event::Leaf(n)) => {
                let expanded = Event::Node(*n, Box::new(Event::Leaf(0)), Box::new(Event::Leaf(0)));
                let (e, cost) = expanded.grow(id)?;
                Some((e, cost + EXPAND_COST))
            }
            (Id::Leaf(true), Event::Node(..)) => None,
            (Id::Node(il, ir), Event::Node(n, el, er)) => {
                let left = el.grow(il);
                let right = er.grow(ir);
                match (left, right) {
                    (Some((el2, cl)), Some((_, cr))) if cl < cr => {
                        Some((Event::Node(*n, Box::new(el2), er.clone()), cl + 1))
                    }
                    (_, Some((er2, cr))) => Some((Event::Node(*n, el.clone(), Box::new(er2)), cr + 1)),
                    (Some((el2, cl)), None) => {
                        Some((Event::Node(*n, Box::new(el2), er.clone()), cl + 1))
                    }
                    (None, None) => None,
                }
            }
        }
    }
}

/// A forkable, joinable logical clock value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    id: Id,
    event: Event,
}

impl Stamp {
    /// The stamp of a lace founder: owns the whole identity space.
    #[must_use]
    pub fn seed() -> Self {
        Self {
            id: ONE,
            event: Event::Leaf(0),
        }
    }

    /// True if this stamp owns part of the identity space and can record events.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        !self.id.is_zero()
    }

    /// Split ownership with a newcomer.
    ///
    /// `self` keeps one half and the returned stamp carries the other. Both
    /// record an event, so each strictly dominates the pre-fork value and
    /// the two are concurrent until one learns of the other.
    pub fn fork(&mut self) -> Stamp {
        let (mine, theirs) = self.id.split();
        self.id = mine;
        let mut child = Stamp {
            id: theirs,
            event: self.event.clone(),
        };
        self.event();
        child.event();
        child
    }

    /// Record a local event. A no-op for anonymous stamps.
    pub fn event(&mut self) {
        let filled = self.event.fill(&self.id);
        if filled != self.event {
            self.event = filled;
        } else if let Some((grown, _)) = self.event.grow(&self.id) {
            self.event = grown;
        }
    }

    /// An anonymous copy carrying only the event tree.
    #[must_use]
    pub fn peek(&self) -> Stamp {
        Stamp {
            id: ZERO,
            event: self.event.clone(),
        }
    }

    /// Merge another stamp into this one.
    pub fn join(&mut self, other: &Stamp) {
        self.id = self.id.sum(&other.id);
        self.event = self.event.join(&other.event);
    }

    /// Happens-before-or-equal.
    #[must_use]
    pub fn leq(&self, other: &Stamp) -> bool {
        self.event.leq(&other.event)
    }

    /// True if neither stamp happened before the other.
    #[must_use]
    pub fn is_concurrent(&self, other: &Stamp) -> bool {
        !self.leq(other) && !other.leq(self)
    }

    /// Causal comparison; `None` when concurrent.
    #[must_use]
    pub fn causal_cmp(&self, other: &Stamp) -> Option<Ordering> {
        match (self.leq(other), other.leq(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    /// Encode for the wire (base64 of the JSON tree form).
    pub fn encode(&self) -> String {
        // Serialising plain enums of integers and booleans into a Vec cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode a stamp produced by [`Stamp::encode`].
    pub fn decode(encoded: &str) -> Result<Stamp> {
        let json = STANDARD.decode(encoded)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_dominates_and_is_concurrent() {
        let mut parent = Stamp::seed();
        let before = parent.clone();
        let child = parent.fork();

        assert!(before.leq(&parent));
        assert!(before.leq(&child));
        assert!(!parent.leq(&before));
        assert!(!child.leq(&before));
        assert!(parent.is_concurrent(&child));
    }

    #[test]
    fn test_join_restores_order() {
        let mut a = Stamp::seed();
        let mut b = a.fork();
        b.event();

        a.join(&b.peek());
        assert!(b.leq(&a));
        a.event();
        assert_eq!(b.causal_cmp(&a), Some(Ordering::Less));
    }

    #[test]
    fn test_peek_does_not_transfer_ownership() {
        let mut a = Stamp::seed();
        let b = a.fork();
        let mut c = b.peek();
        assert!(!c.is_owner());
        let before = c.clone();
        c.event();
        assert_eq!(c, before);
        assert!(a.is_owner());
    }

    #[test]
    fn test_repeated_forks_stay_distinct() {
        let mut root = Stamp::seed();
        let mut children: Vec<Stamp> = (0..6).map(|_| root.fork()).collect();
        for child in children.iter_mut() {
            child.event();
            assert!(child.is_owner());
        }
        for (i, a) in children.iter().enumerate() {
            for b in children.iter().skip(i + 1) {
                assert!(a.is_concurrent(b));
            }
        }
    }

    #[test]
    fn test_join_everything_back_to_seed_ownership() {
        let mut a = Stamp::seed();
        let b = a.fork();
        a.join(&b);
        assert_eq!(a.id, ONE);
        assert!(b.leq(&a));
    }

    #[test]
    fn test_encode_round_trip_is_equal() {
        let mut a = Stamp::seed();
        let mut b = a.fork();
        b.event();
        b.event();
        let _ = b.fork();

        let decoded = Stamp::decode(&b.encode()).unwrap();
        assert_eq!(decoded.causal_cmp(&b), Some(Ordering::Equal));
        assert_eq!(decoded, b);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Stamp::decode("not base64 !!").is_err());
        let not_a_clock = STANDARD.encode(b"{\"id\": 7}");
        assert!(Stamp::decode(&not_a_clock).is_err());
    }
}
