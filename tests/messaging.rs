//! Integration test: application payloads, hooks and direct replies.

mod common;

use common::{Cluster, wait_until};
use lacecast::HookError;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;

#[tokio::test]
async fn test_send_to_one_peer_and_reply() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    let (a, b) = (cluster.nodes[0].clone(), cluster.nodes[1].clone());

    b.subscribe(|payload, reply| {
        if payload == &json!("ping") {
            reply.reply(json!("pong"))?;
        }
        Ok(())
    });
    let answers = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = Arc::clone(&answers);
    a.subscribe(move |payload, _| {
        sink.lock().push(payload.clone());
        Ok(())
    });

    assert_eq!(a.send_to_one_peer(json!("ping"))?, b.id());
    wait_until("reply", || !answers.lock().is_empty()).await?;
    assert_eq!(*answers.lock(), vec![json!("pong")]);

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_failing_hook_does_not_block_others() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    let (a, b) = (cluster.nodes[0].clone(), cluster.nodes[1].clone());

    b.subscribe(|_, _| Err(HookError::from("rejected")));
    let got = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = Arc::clone(&got);
    let id = b.subscribe(move |payload, _| {
        sink.lock().push(payload.clone());
        Ok(())
    });

    a.broadcast(json!(1))?;
    wait_until("delivery", || got.lock().len() == 1).await?;

    assert!(b.unsubscribe(id));
    a.broadcast(json!(2))?;
    cluster.settle().await;
    assert_eq!(*got.lock(), vec![json!(1)]);

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_send_without_peers_fails() -> anyhow::Result<()> {
    let mut cluster = Cluster::new();
    let lone = cluster.spawn(&[])?;
    assert!(matches!(
        lone.send_to_one_peer(json!("anyone?")),
        Err(lacecast::NodeError::NoPeers)
    ));
    cluster.stop_all().await;
    Ok(())
}
