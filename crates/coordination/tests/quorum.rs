//! Lock and semaphore scenarios over a converged 3-node cluster.

use clique_coordination::{
    CoordinationError, LockConfig, LockManager, SemaphoreConfig, SemaphoreManager,
};
use clique_core::Node;
use clique_gossip::{Gossip, GossipConfig};
use clique_network::{KernelConfig, NetKernel};
use std::collections::HashSet;
use std::time::Duration;

struct TestNode {
    kernel: NetKernel,
    gossip: Gossip,
    locks: LockManager,
    sems: SemaphoreManager,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("clique_coordination=debug")
        .try_init();
}

async fn start_node(id: &str) -> TestNode {
    init_tracing();
    let config = KernelConfig::new("127.0.0.1", 0)
        .with_cookie("c")
        .with_retry(Duration::from_millis(20));
    let kernel = NetKernel::new(Node::new(id, "127.0.0.1", 0), config);
    kernel.start(None).await.unwrap();

    let gossip = Gossip::new(
        kernel.clone(),
        GossipConfig::default().with_interval(Duration::from_millis(100)),
        None,
    );
    gossip.start("r").await.unwrap();

    let locks = LockManager::new(gossip.clone(), LockConfig::default(), None);
    locks.start("locks").await.unwrap();
    let sems = SemaphoreManager::new(gossip.clone(), SemaphoreConfig::default(), None);
    sems.start("sems").await.unwrap();

    TestNode {
        kernel,
        gossip,
        locks,
        sems,
    }
}

async fn start_cluster() -> Vec<TestNode> {
    let a = start_node("a").await;
    let b = start_node("b").await;
    let c = start_node("c").await;

    b.gossip.meet(&a.kernel.node()).await.unwrap();
    c.gossip.meet(&a.kernel.node()).await.unwrap();

    let expected: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let nodes = vec![a, b, c];
    for node in &nodes {
        for _ in 0..100 {
            let have: HashSet<String> = node
                .gossip
                .nodes()
                .await
                .iter()
                .map(|n| n.id().to_string())
                .collect();
            if have == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    nodes
}

#[tokio::test]
async fn write_lock_is_exclusive_across_the_cluster() {
    let cluster = start_cluster().await;
    let dlm = &cluster[0].locks;

    let granted = dlm.wlock("k", "h1", 30_000, Some(0)).await.unwrap();
    assert!(granted.len() >= 2);

    // A competing holder cannot reach quorum while h1 holds the lock.
    let contender = &cluster[1].locks;
    let denied = contender.wlock("k", "h2", 30_000, Some(0)).await;
    assert!(matches!(
        denied,
        Err(CoordinationError::QuorumFailure { .. })
    ));

    let released = dlm.wunlock(&granted, "k", "h1").await.unwrap();
    assert_eq!(released.len(), granted.len());

    let granted = contender.wlock("k", "h2", 30_000, Some(0)).await.unwrap();
    assert!(granted.len() >= 2);
}

#[tokio::test]
async fn read_locks_compose_and_block_writes() {
    let cluster = start_cluster().await;

    let n1 = cluster[0]
        .locks
        .rlock("k", "h1", 30_000, Some(0))
        .await
        .unwrap();
    assert!(!n1.is_empty());
    let n2 = cluster[1]
        .locks
        .rlock("k", "h2", 30_000, Some(0))
        .await
        .unwrap();
    assert!(!n2.is_empty());

    let denied = cluster[2].locks.wlock("k", "h3", 30_000, Some(0)).await;
    assert!(matches!(
        denied,
        Err(CoordinationError::QuorumFailure { .. })
    ));
}

#[tokio::test]
async fn repeated_rlock_by_same_holder_succeeds() {
    let cluster = start_cluster().await;
    let dlm = &cluster[0].locks;

    let first = dlm.rlock("k", "h1", 30_000, Some(0)).await.unwrap();
    let second = dlm.rlock("k", "h1", 30_000, Some(0)).await.unwrap();
    assert_eq!(first.len(), second.len());

    let released = dlm.runlock(&first, "k", "h1").await.unwrap();
    assert_eq!(released.len(), first.len());
    // The holder is gone; a second release finds nothing to remove.
    let released_again = dlm.runlock(&first, "k", "h1").await.unwrap();
    assert!(released_again.is_empty());
}

#[tokio::test]
async fn semaphore_slots_are_bounded_cluster_wide() {
    let cluster = start_cluster().await;

    // Create routes to the owner no matter which node asks.
    cluster[0].sems.create("s", 2).await.unwrap();
    cluster[1].sems.create("s", 2).await.unwrap();

    let conflict = cluster[0].sems.create("s", 3).await;
    assert!(matches!(
        conflict,
        Err(CoordinationError::SemaphoreSizeConflict { existing: 2, .. })
    ));

    cluster[0].sems.post("s", "h1", 30_000, Some(0)).await.unwrap();
    cluster[1].sems.post("s", "h2", 30_000, Some(0)).await.unwrap();

    let full = cluster[2].sems.post("s", "h3", 30_000, Some(0)).await;
    assert!(matches!(full, Err(CoordinationError::SemaphoreFull { .. })));

    let info = cluster[2].sems.read("s").await.unwrap();
    assert_eq!(info.n, 2);
    assert_eq!(info.active, 2);

    assert!(cluster[0].sems.close("s", "h1").await.unwrap());
    cluster[2].sems.post("s", "h3", 30_000, Some(0)).await.unwrap();
}

#[tokio::test]
async fn missing_semaphore_is_reported() {
    let cluster = start_cluster().await;
    let result = cluster[0].sems.post("nope", "h1", 30_000, Some(0)).await;
    assert!(matches!(
        result,
        Err(CoordinationError::SemaphoreMissing { .. })
    ));
}
