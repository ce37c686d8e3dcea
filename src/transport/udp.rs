//! Datagram transport.
//!
//! Each body is framed by [`lace_proto::datagram`]: a SHA-256 prefix and,
//! for large bodies, fragment headers. Corrupt datagrams are dropped at
//! `debug` level; pieces are held in a bounded reassembler until complete.

use super::{INBOUND_QUEUE, Inbound, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use lace_proto::datagram::{self, Reassembler};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Largest datagram accepted from the socket.
const RECV_BUFFER: usize = 65_536;

/// UDP transport bound to one socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind `addr` and start receiving.
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let reader = tokio::spawn(read_loop(Arc::clone(&socket), tx));
        info!(addr = %local, "UDP transport bound");
        Ok((
            Arc::new(Self {
                socket,
                local,
                reader: Mutex::new(Some(reader)),
            }),
            rx,
        ))
    }
}

async fn read_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    let mut reassembler = Reassembler::default();
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable surfaces here on some platforms; keep going.
                debug!(error = %e, "UDP receive failed");
                continue;
            }
        };
        let frame = match datagram::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %from, kind = e.kind(), "dropping datagram");
                continue;
            }
        };
        let bytes = match reassembler.accept(frame) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                debug!(peer = %from, kind = e.kind(), "dropping fragment");
                continue;
            }
        };
        if tx.send(Inbound { bytes, from }).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, bytes: Bytes, to: SocketAddr) -> Result<(), TransportError> {
        for frame in datagram::encode(&bytes)? {
            self.socket.send_to(&frame, to).await?;
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
            info!(addr = %self.local, "UDP transport shut down");
        }
    }
}
