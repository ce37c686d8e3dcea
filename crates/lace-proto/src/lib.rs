//! # lace-proto
//!
//! Wire-level building blocks for the lacecast overlay.
//!
//! ## Features
//!
//! - [`Coord`]: lace coordinates, the fill rule and the row/column locality predicate
//! - [`Stamp`]: an interval tree clock that can be forked and joined between members
//! - [`Envelope`] and [`Body`]: the JSON wire envelope and its closed set of message kinds
//! - [`datagram`]: integrity-checked framing with fragmentation and reassembly
//!
//! Nothing in this crate holds runtime state beyond the fragment reassembler.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod clock;
pub mod coord;
pub mod datagram;
pub mod error;
pub mod message;

pub use self::clock::Stamp;
pub use self::coord::Coord;
pub use self::error::{ProtocolError, Result};
pub use self::message::{Body, Envelope, MaekawaKind, NodeId, WireAddr};
