//! Integration test common infrastructure.
//!
//! Runs real nodes on an in-memory network and waits for them to converge.

#![allow(dead_code)]

use lacecast::overlay::Settings;
use lacecast::transport::MemoryNetwork;
use lacecast::{Broadcaster, NodeId, Phase};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Heartbeat long enough that no tick fires during a test unless asked for.
pub const QUIET_HEARTBEAT: Duration = Duration::from_secs(3600);

/// How long to wait for a condition before failing.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Poll `check` until it holds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + PATIENCE;
    while !check() {
        if Instant::now() > deadline {
            anyhow::bail!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Nodes sharing one [`MemoryNetwork`].
pub struct Cluster {
    pub net: MemoryNetwork,
    pub nodes: Vec<Broadcaster>,
    heartbeat: Duration,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_heartbeat(QUIET_HEARTBEAT)
    }

    pub fn with_heartbeat(heartbeat: Duration) -> Self {
        Self {
            net: MemoryNetwork::new(),
            nodes: Vec::new(),
            heartbeat,
        }
    }

    /// Start a node that joins via the given members, or founds a lace if none.
    pub fn spawn(&mut self, via: &[usize]) -> anyhow::Result<Broadcaster> {
        let (transport, inbound) = self.net.bind();
        let settings = Settings {
            bootstrap: via.iter().map(|i| self.addr(*i)).collect(),
            ..Settings::default()
        };
        let node = Broadcaster::new(NodeId::random(), settings, transport, self.heartbeat);
        node.start(inbound)?;
        self.nodes.push(node.clone());
        Ok(node)
    }

    /// A lace of `n` members, each joined through the founder in turn.
    pub async fn lace(n: usize) -> anyhow::Result<Self> {
        let mut cluster = Self::new();
        cluster.spawn(&[])?;
        for _ in 1..n {
            let node = cluster.spawn(&[0])?;
            wait_until("join", || node.phase() == Phase::Member).await?;
            cluster.settle().await;
        }
        Ok(cluster)
    }

    pub fn addr(&self, i: usize) -> SocketAddr {
        self.nodes[i].local_addr()
    }

    /// Wait until no message has moved for a little while.
    pub async fn settle(&self) {
        let mut last = self.net.delivered();
        loop {
            sleep(Duration::from_millis(30)).await;
            let now = self.net.delivered();
            if now == last {
                return;
            }
            last = now;
        }
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}
