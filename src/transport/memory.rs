//! In-process transport for tests and simulations.
//!
//! A [`MemoryNetwork`] is a registry of bound endpoints keyed by socket
//! address. Delivery preserves order per sender. Links can be cut and
//! healed to simulate partitions; traffic over a cut link is dropped
//! silently, like a lost datagram.

use super::{INBOUND_QUEUE, Inbound, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

const FIRST_PORT: u16 = 10_000;

#[derive(Debug)]
struct Hub {
    endpoints: DashMap<SocketAddr, mpsc::Sender<Inbound>>,
    cut: DashSet<(SocketAddr, SocketAddr)>,
    next_port: AtomicU16,
    delivered: AtomicU64,
}

/// Shared in-memory network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                endpoints: DashMap::new(),
                cut: DashSet::new(),
                next_port: AtomicU16::new(FIRST_PORT),
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Bind a fresh endpoint on `127.0.0.1` with the next free port.
    pub fn bind(&self) -> (Arc<MemoryTransport>, mpsc::Receiver<Inbound>) {
        let port = self.hub.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        self.hub.endpoints.insert(addr, tx);
        (
            Arc::new(MemoryTransport {
                local: addr,
                network: self.clone(),
            }),
            rx,
        )
    }

    /// Drop traffic between `a` and `b` in both directions.
    pub fn partition(&self, a: SocketAddr, b: SocketAddr) {
        self.hub.cut.insert((a, b));
        self.hub.cut.insert((b, a));
    }

    /// Restore traffic between `a` and `b`.
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.hub.cut.remove(&(a, b));
        self.hub.cut.remove(&(b, a));
    }

    /// Total bodies delivered so far.
    pub fn delivered(&self) -> u64 {
        self.hub.delivered.load(Ordering::Relaxed)
    }
}

/// One endpoint of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    local: SocketAddr,
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, bytes: Bytes, to: SocketAddr) -> Result<(), TransportError> {
        let hub = &self.network.hub;
        if hub.cut.contains(&(self.local, to)) {
            trace!(from = %self.local, to = %to, "dropped on cut link");
            return Ok(());
        }
        let Some(endpoint) = hub.endpoints.get(&to).map(|e| e.value().clone()) else {
            return Err(TransportError::Unreachable(to));
        };
        endpoint
            .send(Inbound {
                bytes,
                from: self.local,
            })
            .await
            .map_err(|_| TransportError::Unreachable(to))?;
        hub.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn shutdown(&self) {
        self.network.hub.endpoints.remove(&self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_and_partition() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.bind();
        let (b, mut rx_b) = net.bind();
        assert_ne!(a.local_addr(), b.local_addr());

        a.send(Bytes::from_static(b"one"), b.local_addr()).await.unwrap();
        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.bytes.as_ref(), b"one");
        assert_eq!(got.from, a.local_addr());

        net.partition(a.local_addr(), b.local_addr());
        a.send(Bytes::from_static(b"lost"), b.local_addr()).await.unwrap();
        net.heal(a.local_addr(), b.local_addr());
        a.send(Bytes::from_static(b"two"), b.local_addr()).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().bytes.as_ref(), b"two");
        assert_eq!(net.delivered(), 2);
    }

    #[tokio::test]
    async fn test_unbound_destination_unreachable() {
        let net = MemoryNetwork::new();
        let (a, _rx) = net.bind();
        let (b, _rx_b) = net.bind();
        let gone = b.local_addr();
        b.shutdown().await;
        let err = a.send(Bytes::from_static(b"x"), gone).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(addr) if addr == gone));
    }
}
