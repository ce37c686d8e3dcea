//! Integration test: the cluster-wide mutex between running nodes.

mod common;

use common::{Cluster, wait_until};
use lacecast::NodeError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

async fn contend(cluster: &Cluster) -> anyhow::Result<usize> {
    let inside = Arc::new(AtomicBool::new(false));
    let entries = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for node in cluster.nodes.clone() {
        let inside = Arc::clone(&inside);
        let entries = Arc::clone(&entries);
        handles.push(tokio::spawn(async move {
            node.acquire_mutex_timeout(Duration::from_secs(5)).await?;
            assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
            entries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            inside.store(false, Ordering::SeqCst);
            node.release_mutex()?;
            Ok::<_, NodeError>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    Ok(entries.load(Ordering::SeqCst))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_nodes_take_turns() -> anyhow::Result<()> {
    let cluster = Cluster::lace(3).await?;
    assert_eq!(contend(&cluster).await?, 3);
    cluster.stop_all().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_nodes_take_turns_twice() -> anyhow::Result<()> {
    let cluster = Cluster::lace(5).await?;
    assert_eq!(contend(&cluster).await?, 5);
    assert_eq!(contend(&cluster).await?, 5);
    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_timeout_leaves_request_outstanding() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    let (a, b) = (cluster.nodes[0].clone(), cluster.nodes[1].clone());

    a.acquire_mutex_timeout(Duration::from_secs(5)).await?;
    let err = b.acquire_mutex_timeout(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, NodeError::MutexTimeout(_)));
    assert!(matches!(b.acquire_mutex(|| {}), Err(NodeError::MutexBusy)));

    // The request survives the caller's timeout and completes later.
    a.release_mutex()?;
    wait_until("late grant", || b.is_mutex_held()).await?;
    b.release_mutex()?;

    cluster.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn test_release_withdraws_pending_request() -> anyhow::Result<()> {
    let cluster = Cluster::lace(2).await?;
    let (a, b) = (cluster.nodes[0].clone(), cluster.nodes[1].clone());

    a.acquire_mutex_timeout(Duration::from_secs(5)).await?;
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    b.acquire_mutex(move || flag.store(true, Ordering::SeqCst))?;
    cluster.settle().await;

    b.release_mutex()?;
    a.release_mutex()?;
    cluster.settle().await;
    assert!(!fired.load(Ordering::SeqCst));
    assert!(!b.is_mutex_held());

    // Both sides are free again.
    a.acquire_mutex_timeout(Duration::from_secs(5)).await?;
    a.release_mutex()?;
    cluster.settle().await;
    b.acquire_mutex_timeout(Duration::from_secs(5)).await?;
    b.release_mutex()?;

    cluster.stop_all().await;
    Ok(())
}
