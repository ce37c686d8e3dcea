//! The node façade.
//!
//! A [`Broadcaster`] owns one [`NodeState`] behind a single lock and drives
//! it from three tasks:
//!
//! - the receive loop decodes inbound frames and feeds them to the state
//! - the tick loop runs housekeeping every heartbeat
//! - the writer drains an outbound queue into the transport
//!
//! Every operation takes the lock, collects [`Effects`], releases the lock
//! and only then sends, runs acquisition callbacks and fires hooks.

use crate::config::{Config, TransportKind};
use crate::error::{NodeError, Result};
use crate::metrics::{self, MutexEvent};
use crate::notifier::{HookError, Notifier, Payload, Reply, SubscriptionId};
use crate::overlay::{Effects, NodeState, Phase, Settings};
use crate::telemetry::spans;
use crate::transport::{Inbound, TcpTransport, Transport, UdpTransport};
use bytes::Bytes;
use lace_proto::{Coord, Envelope, NodeId, Stamp};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};

type Outbound = (SocketAddr, Bytes);

struct Inner {
    id: NodeId,
    state: Mutex<NodeState>,
    transport: Arc<dyn Transport>,
    notifier: Notifier,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Taken by `start`.
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat: Duration,
    stopped: AtomicBool,
}

impl Inner {
    /// Run `f` under the node lock, then apply what it produced.
    fn with_state<R>(self: &Arc<Self>, f: impl FnOnce(&mut NodeState, &mut Effects) -> R) -> R {
        let mut fx = Effects::new();
        let out = {
            let mut state = self.state.lock();
            f(&mut state, &mut fx)
        };
        self.apply(fx);
        out
    }

    fn apply(self: &Arc<Self>, fx: Effects) {
        for (to, env) in fx.sends {
            match env.to_bytes() {
                Ok(bytes) => {
                    if self.outbound.send((to, Bytes::from(bytes))).is_err() {
                        debug!(peer = %to, "writer gone, dropping message");
                    }
                }
                Err(e) => warn!(kind = e.kind(), "failed to encode envelope"),
            }
        }
        for on_granted in fx.granted {
            on_granted();
        }
        for delivery in fx.deliveries {
            let reply = ReplyHandle {
                to: delivery.reply_to,
                inner: Arc::downgrade(self),
            };
            let failed = self.notifier.fire(&delivery.data, &reply);
            if failed > 0 {
                debug!(from = %delivery.from.short(), failed, "hooks failed for payload");
            }
        }
    }

    fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        let Inbound { bytes, from } = inbound;
        let env = match Envelope::from_bytes(&bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(peer = %from, kind = e.kind(), "dropping undecodable message");
                return;
            }
        };
        let _span = spans::message(env.body.kind(), from).entered();
        self.with_state(|state, fx| state.receive(env, from, fx));
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(NodeError::Stopped);
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Reply handle given to hooks; answers the payload's origin directly.
struct ReplyHandle {
    to: SocketAddr,
    inner: Weak<Inner>,
}

impl Reply for ReplyHandle {
    fn reply(&self, data: Payload) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(NodeError::Stopped)?;
        inner.ensure_running()?;
        inner.with_state(|state, fx| state.reply(self.to, data, fx));
        Ok(())
    }
}

/// A lace member: broadcast, causal clock and cluster-wide mutex.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// Create a node over `transport`. Nothing runs until [`start`](Self::start).
    pub fn new(id: NodeId, settings: Settings, transport: Arc<dyn Transport>, heartbeat: Duration) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(NodeState::new(id, settings)),
                transport,
                notifier: Notifier::new(),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                tasks: Mutex::new(Vec::new()),
                heartbeat,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the configured transport, then start a node with a fresh id.
    pub async fn launch(config: &Config) -> Result<Self> {
        let (transport, inbound) = match config.node.transport {
            TransportKind::Udp => {
                let (transport, inbound) = UdpTransport::bind(config.node.listen).await?;
                (transport as Arc<dyn Transport>, inbound)
            }
            TransportKind::Tcp => {
                let (transport, inbound) = TcpTransport::bind(config.node.listen).await?;
                (transport as Arc<dyn Transport>, inbound)
            }
        };
        let node = Self::new(NodeId::random(), config.settings(), transport, config.heartbeat());
        node.start(inbound)?;
        Ok(node)
    }

    /// Spawn the node's tasks, then join the configured bootstrap members or,
    /// with none configured, found a new lace.
    pub fn start(&self, inbound: mpsc::Receiver<Inbound>) -> Result<()> {
        self.inner.ensure_running()?;
        let outbound_rx = self.inner.outbound_rx.lock().take().ok_or(NodeError::AlreadyStarted)?;
        let span = spans::node(&self.inner.id, self.local_addr());

        {
            let mut tasks = self.inner.tasks.lock();
            tasks.push(tokio::spawn(
                write_loop(Arc::clone(&self.inner.transport), outbound_rx).instrument(span.clone()),
            ));
            tasks.push(tokio::spawn(
                receive_loop(Arc::downgrade(&self.inner), inbound).instrument(span.clone()),
            ));
            tasks.push(tokio::spawn(
                tick_loop(Arc::downgrade(&self.inner), self.inner.heartbeat).instrument(span.clone()),
            ));
        }

        let _entered = span.enter();
        let bootstrap = self.inner.state.lock().settings().bootstrap.clone();
        if bootstrap.is_empty() {
            self.inner.state.lock().found()
        } else {
            self.join(&bootstrap)
        }
    }

    /// Ask the members at `targets` for a coordinate.
    pub fn join(&self, targets: &[SocketAddr]) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.with_state(|state, fx| state.join(targets, fx))
    }

    /// Say goodbye to every peer, stop all tasks and shut the transport down.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut fx = Effects::new();
        self.inner.state.lock().leave(&mut fx);

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        // The writer is gone; send the goodbyes directly.
        for (to, env) in fx.sends {
            match env.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = self.inner.transport.send(Bytes::from(bytes), to).await {
                        debug!(peer = %to, error = %e, "goodbye not sent");
                    }
                }
                Err(e) => warn!(kind = e.kind(), "failed to encode envelope"),
            }
        }
        self.inner.transport.shutdown().await;
        info!(node = %self.inner.id.short(), "node stopped");
    }

    /// Flood `data` to every member.
    pub fn broadcast(&self, data: Payload) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.with_state(|state, fx| state.broadcast_data(data, fx))
    }

    /// Send `data` to one peer chosen at random; returns the peer's id.
    pub fn send_to_one_peer(&self, data: Payload) -> Result<NodeId> {
        self.inner.ensure_running()?;
        self.inner.with_state(|state, fx| state.send_one(data, fx))
    }

    /// Request the cluster-wide lock. `on_granted` runs once, on whichever
    /// task completes the acquisition, unless the request is released first.
    pub fn acquire_mutex<F>(&self, on_granted: F) -> Result<u64>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.ensure_running()?;
        self.inner
            .with_state(|state, fx| state.acquire_mutex(Some(Box::new(on_granted)), fx))
    }

    /// Request the lock and wait up to `timeout` for it.
    ///
    /// On timeout the request stays outstanding and may still complete later;
    /// call [`release_mutex`](Self::release_mutex) to withdraw it.
    pub async fn acquire_mutex_timeout(&self, timeout: Duration) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        let seq = self.acquire_mutex(move || {
            let _ = tx.send(());
        })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(seq),
            Ok(Err(_)) => Err(NodeError::MutexCancelled),
            Err(_) => {
                warn!(node = %self.inner.id.short(), seq, ?timeout, "mutex acquisition timed out");
                metrics::record_mutex(MutexEvent::Timeout);
                Err(NodeError::MutexTimeout(timeout))
            }
        }
    }

    /// Release the lock, or withdraw a request that is still in flight.
    pub fn release_mutex(&self) -> Result<u64> {
        self.inner.ensure_running()?;
        self.inner.with_state(|state, fx| state.release_mutex(fx))
    }

    /// Register a hook for received application payloads.
    pub fn subscribe<F>(&self, hook: F) -> SubscriptionId
    where
        F: Fn(&Payload, &dyn Reply) -> std::result::Result<(), HookError> + Send + Sync + 'static,
    {
        self.inner.notifier.subscribe(hook)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(id)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn coord(&self) -> Coord {
        self.inner.state.lock().coord()
    }

    pub fn lace_max(&self) -> Coord {
        self.inner.state.lock().lace_max()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase()
    }

    /// Current peers and their coordinates, in id order.
    pub fn peers(&self) -> Vec<(NodeId, Coord)> {
        self.inner
            .state
            .lock()
            .peers()
            .iter()
            .map(|(id, peer)| (*id, peer.coord))
            .collect()
    }

    /// Snapshot of the causal clock; `None` until joined.
    pub fn clock(&self) -> Option<Stamp> {
        self.inner.state.lock().clock().cloned()
    }

    pub fn is_mutex_held(&self) -> bool {
        self.inner.state.lock().mutex().is_held()
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("id", &self.inner.id)
            .field("addr", &self.local_addr())
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

async fn write_loop(transport: Arc<dyn Transport>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some((to, bytes)) = rx.recv().await {
        if let Err(e) = transport.send(bytes, to).await {
            debug!(peer = %to, error = %e, "send failed");
        }
    }
}

async fn receive_loop(inner: Weak<Inner>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_inbound(frame);
    }
    debug!("receive loop finished");
}

async fn tick_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.with_state(|state, fx| state.tick(fx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use serde_json::json;

    fn node(net: &MemoryNetwork, bootstrap: Vec<SocketAddr>) -> Broadcaster {
        let (transport, inbound) = net.bind();
        let settings = Settings {
            bootstrap,
            ..Settings::default()
        };
        let node = Broadcaster::new(NodeId::random(), settings, transport, Duration::from_secs(3600));
        node.start(inbound).unwrap();
        node
    }

    #[tokio::test]
    async fn test_founder_without_bootstrap() {
        let net = MemoryNetwork::new();
        let a = node(&net, Vec::new());
        assert_eq!(a.phase(), Phase::Member);
        assert_eq!(a.coord(), Coord::ORIGIN);
        assert!(a.clock().is_some());
        assert!(matches!(a.start(net.bind().1), Err(NodeError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_single_node_mutex() {
        let net = MemoryNetwork::new();
        let a = node(&net, Vec::new());
        a.acquire_mutex_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(a.is_mutex_held());
        assert!(matches!(a.acquire_mutex(|| {}), Err(NodeError::MutexBusy)));
        a.release_mutex().unwrap();
        assert!(!a.is_mutex_held());
        assert!(matches!(a.release_mutex(), Err(NodeError::MutexNotHeld)));
    }

    #[tokio::test]
    async fn test_mutex_timeout_is_counted() {
        metrics::init();
        let timeouts = || {
            metrics::MUTEX_EVENTS
                .get()
                .map_or(0, |c| c.with_label_values(&["timeout"]).get())
        };

        let net = MemoryNetwork::new();
        let a = node(&net, Vec::new());
        let b = node(&net, vec![a.local_addr()]);
        for _ in 0..200 {
            if b.phase() == Phase::Member && a.peers().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.peers().len(), 1);

        b.acquire_mutex_timeout(Duration::from_secs(1)).await.unwrap();
        let before = timeouts();
        let err = a.acquire_mutex_timeout(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, NodeError::MutexTimeout(_)));
        assert!(timeouts() > before);
    }

    #[tokio::test]
    async fn test_operations_after_stop() {
        let net = MemoryNetwork::new();
        let a = node(&net, Vec::new());
        a.stop().await;
        a.stop().await;
        assert_eq!(a.phase(), Phase::Unjoined);
        assert!(matches!(a.broadcast(json!(1)), Err(NodeError::Stopped)));
        assert!(matches!(a.release_mutex(), Err(NodeError::Stopped)));
    }
}
