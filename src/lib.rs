//! lacecast - broadcast, causal clocks and a cluster-wide mutex over a
//! self-organising peer-to-peer lace.
//!
//! Nodes hold a coordinate in a two-dimensional grid and peer with the
//! members of their row and column. Messages flood across those peers and
//! are deduplicated by nonce; a Maekawa mutex uses each node's peer set as
//! its quorum.

pub mod broadcaster;
pub mod config;
pub mod dedup;
pub mod error;
pub mod maekawa;
pub mod metrics;
pub mod notifier;
pub mod overlay;
pub mod telemetry;
pub mod transport;

pub use broadcaster::Broadcaster;
pub use config::Config;
pub use error::{NodeError, Result};
pub use lace_proto::{Coord, NodeId, Stamp};
pub use notifier::{HookError, Payload, Reply, SubscriptionId};
pub use overlay::Phase;
