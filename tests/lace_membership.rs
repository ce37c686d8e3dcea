//! Integration test: lace membership over the in-memory network.

mod common;

use common::{Cluster, wait_until};
use lacecast::transport::MemoryNetwork;
use lacecast::{Broadcaster, Coord, NodeId, Phase};
use lacecast::overlay::Settings;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

fn recorder(node: &Broadcaster) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.subscribe(move |payload, _| {
        sink.lock().push(payload.clone());
        Ok(())
    });
    seen
}

#[tokio::test]
async fn test_two_node_join() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);

    assert_eq!(a.coord(), Coord::new(1, 1));
    assert_eq!(b.coord(), Coord::new(2, 1));
    assert_eq!(a.peers(), vec![(b.id(), Coord::new(2, 1))]);
    assert_eq!(b.peers(), vec![(a.id(), Coord::new(1, 1))]);
    assert_eq!(a.lace_max(), Coord::new(2, 1));
    assert_eq!(b.lace_max(), Coord::new(2, 1));

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_lace_fills_in_order_and_floods_once() -> anyhow::Result<()> {
    let cluster = Cluster::lace(5).await?;
    let coords: Vec<Coord> = cluster.nodes.iter().map(|n| n.coord()).collect();
    assert_eq!(
        coords,
        vec![
            Coord::new(1, 1),
            Coord::new(2, 1),
            Coord::new(1, 2),
            Coord::new(2, 2),
            Coord::new(3, 1),
        ]
    );

    let inboxes: Vec<_> = cluster.nodes.iter().map(recorder).collect();
    cluster.nodes[4].broadcast(json!({"hello": "lace"}))?;
    cluster.settle().await;

    for (i, inbox) in inboxes.iter().enumerate().take(4) {
        assert_eq!(*inbox.lock(), vec![json!({"hello": "lace"})], "node {i}");
    }
    assert!(inboxes[4].lock().is_empty());

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_clock_carries_history() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);

    a.broadcast(json!("tick"))?;
    cluster.settle().await;
    let sent = a.clock().ok_or_else(|| anyhow::anyhow!("a has no clock"))?;
    let received = b.clock().ok_or_else(|| anyhow::anyhow!("b has no clock"))?;
    assert!(sent.leq(&received));

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_says_goodbye() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    cluster.nodes[1].stop().await;
    let a = cluster.nodes[0].clone();
    wait_until("peer removed", || a.peers().is_empty()).await?;
    assert_eq!(cluster.nodes[1].phase(), Phase::Unjoined);

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_bootstrap_keeps_joining() -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let (transport, inbound) = net.bind();
    let settings = Settings {
        bootstrap: vec!["127.0.0.1:1".parse()?],
        ..Settings::default()
    };
    let node = Broadcaster::new(NodeId::random(), settings, transport, Duration::from_millis(20));
    node.start(inbound)?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.phase(), Phase::Joining);
    assert!(node.broadcast(json!(1)).is_err());

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_partitioned_peer_expires_and_returns() -> anyhow::Result<()> {
    let mut cluster = Cluster::with_heartbeat(Duration::from_millis(20));
    cluster.spawn(&[])?;
    let b = cluster.spawn(&[0])?;
    wait_until("join", || b.phase() == Phase::Member).await?;
    let a = cluster.nodes[0].clone();
    wait_until("peered", || a.peers().len() == 1).await?;

    cluster.net.partition(cluster.addr(0), cluster.addr(1));
    wait_until("peer expired", || a.peers().is_empty()).await?;

    cluster.net.heal(cluster.addr(0), cluster.addr(1));
    wait_until("peer rediscovered", || a.peers().len() == 1 && b.peers().len() == 1).await?;
    assert_eq!(a.coord(), Coord::new(1, 1));
    assert_eq!(b.coord(), Coord::new(2, 1));

    cluster.stop_all().await;
    Ok(())
}
