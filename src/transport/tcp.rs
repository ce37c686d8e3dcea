//! Stream transport: the reliable fallback.
//!
//! Every body travels as one frame with a 4-byte big-endian length prefix
//! ([`LengthDelimitedCodec`]). Outbound connections are opened on first use
//! and kept per destination; inbound connections report the remote socket
//! address as the source, so nodes using this transport must advertise a
//! reply address in their envelopes.
//!
//! Sending never waits on a slow destination: frames for a connection whose
//! queue is full are dropped, as a datagram would be.

use super::{INBOUND_QUEUE, Inbound, Transport, TransportError};
use crate::metrics;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, trace};

/// Frames queued per outbound connection before new ones are dropped.
const OUTBOUND_QUEUE: usize = 256;

/// How long an outbound connect may take before the destination is given up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// TCP transport with one listener and a pool of outbound streams.
#[derive(Debug)]
pub struct TcpTransport {
    local: SocketAddr,
    outbound: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

impl TcpTransport {
    /// Bind `addr` and start accepting connections.
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let acceptor = tokio::spawn(accept_loop(listener, tx));
        info!(addr = %local, "TCP transport bound");
        Ok((
            Arc::new(Self {
                local,
                outbound: Arc::new(DashMap::new()),
                tasks: Mutex::new(vec![acceptor]),
            }),
            rx,
        ))
    }

    fn writer_for(&self, to: SocketAddr) -> mpsc::Sender<Bytes> {
        if let Some(existing) = self.outbound.get(&to)
            && !existing.is_closed()
        {
            return existing.clone();
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.outbound.insert(to, tx.clone());
        let handle = tokio::spawn(write_loop(to, rx, Arc::clone(&self.outbound)));
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        tx
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Inbound>) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "TCP accept failed");
                continue;
            }
        };
        if tx.is_closed() {
            break;
        }
        debug!(peer = %from, "inbound stream accepted");
        tokio::spawn(read_loop(stream, from, tx.clone()));
    }
}

async fn read_loop(stream: TcpStream, from: SocketAddr, tx: mpsc::Sender<Inbound>) {
    let mut frames = FramedRead::new(stream, codec());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                let inbound = Inbound {
                    bytes: frame.freeze(),
                    from,
                };
                if tx.send(inbound).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(peer = %from, error = %e, "inbound stream failed");
                return;
            }
        }
    }
    debug!(peer = %from, "inbound stream closed");
}

async fn write_loop(
    to: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    registry: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
) {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(to)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(peer = %to, error = %e, "connect failed");
            rx.close();
            registry.remove_if(&to, |_, tx| tx.is_closed());
            return;
        }
        Err(_) => {
            debug!(peer = %to, timeout = ?CONNECT_TIMEOUT, "connect timed out");
            rx.close();
            registry.remove_if(&to, |_, tx| tx.is_closed());
            return;
        }
    };
    let mut sink = FramedWrite::new(stream, codec());
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = sink.send(bytes).await {
            debug!(peer = %to, error = %e, "outbound stream failed");
            break;
        }
    }
    // Closing our receiver marks only our own registry entry as closed.
    rx.close();
    registry.remove_if(&to, |_, tx| tx.is_closed());
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, bytes: Bytes, to: SocketAddr) -> Result<(), TransportError> {
        let writer = self.writer_for(to);
        match writer.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(peer = %to, "outbound queue full, frame dropped");
                metrics::record_frame_dropped("tcp");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Unreachable(to)),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.outbound.clear();
        info!(addr = %self.local, "TCP transport shut down");
    }
}
