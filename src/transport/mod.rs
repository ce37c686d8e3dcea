//! Byte transports between nodes.
//!
//! A transport moves opaque message bodies to and from socket addresses.
//! Binding one yields the transport handle and the receiving end of its
//! inbound queue; the node drains that queue in arrival order.
//!
//! - [`udp::UdpTransport`]: checksummed datagrams, fragmenting large bodies
//! - [`tcp::TcpTransport`]: length-delimited frames over lazily opened streams
//! - [`memory::MemoryTransport`]: in-process hub for tests and simulations

pub mod memory;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;
use lace_proto::ProtocolError;
use std::net::SocketAddr;
use thiserror::Error;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Depth of the inbound queue between a transport and its node.
pub const INBOUND_QUEUE: usize = 1024;

/// One message body received from the network.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Message body, already integrity-checked and reassembled.
    pub bytes: Bytes,
    /// Address the body arrived from.
    pub from: SocketAddr,
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] ProtocolError),

    #[error("no route to {0}")]
    Unreachable(SocketAddr),

    #[error("transport closed")]
    Closed,
}

/// Sends message bodies to socket addresses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `bytes` to `to`. Delivery is not guaranteed.
    async fn send(&self, bytes: Bytes, to: SocketAddr) -> Result<(), TransportError>;

    /// Address this transport receives on.
    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving and release sockets.
    async fn shutdown(&self);
}
