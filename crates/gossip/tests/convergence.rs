//! Multi-node convergence over real sockets.

use clique_core::Node;
use clique_gossip::{Gossip, GossipConfig, GossipEvent};
use clique_network::{KernelConfig, NetKernel};
use std::collections::HashSet;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("clique_gossip=debug")
        .try_init();
}

async fn start_node(id: &str, cookie: &str) -> (NetKernel, Gossip) {
    init_tracing();
    let config = KernelConfig::new("127.0.0.1", 0)
        .with_cookie(cookie)
        .with_retry(Duration::from_millis(20));
    let kernel = NetKernel::new(Node::new(id, "127.0.0.1", 0), config);
    kernel.start(None).await.unwrap();

    let gossip = Gossip::new(
        kernel.clone(),
        GossipConfig::default().with_interval(Duration::from_millis(100)),
        None,
    );
    gossip.start("r").await.unwrap();
    (kernel, gossip)
}

fn ids(nodes: &[Node]) -> HashSet<String> {
    nodes.iter().map(|n| n.id().to_string()).collect()
}

async fn wait_for_members(gossip: &Gossip, expected: &HashSet<String>) {
    for _ in 0..100 {
        if &ids(&gossip.nodes().await) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "ring did not converge: have {:?}, want {:?}",
        ids(&gossip.nodes().await),
        expected
    );
}

#[tokio::test]
async fn meet_converges_two_nodes() {
    let (a_kernel, a) = start_node("a", "c").await;
    let (_b_kernel, b) = start_node("b", "c").await;

    b.meet(&a_kernel.node()).await.unwrap();

    let expected: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    wait_for_members(&a, &expected).await;
    wait_for_members(&b, &expected).await;
}

#[tokio::test]
async fn converged_rings_agree_on_ownership() {
    let (a_kernel, a) = start_node("a", "c").await;
    let (_b_kernel, b) = start_node("b", "c").await;
    let (_c_kernel, c) = start_node("c", "c").await;

    b.meet(&a_kernel.node()).await.unwrap();
    c.meet(&a_kernel.node()).await.unwrap();

    let expected: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    wait_for_members(&a, &expected).await;
    wait_for_members(&b, &expected).await;
    wait_for_members(&c, &expected).await;

    let ra = a.ring().await;
    let rb = b.ring().await;
    let rc = c.ring().await;
    assert_eq!(ra, rb);
    assert_eq!(rb, rc);
    for key in ["k1", "k2", "k3", "k4", "k5"] {
        assert_eq!(ra.find(key), rb.find(key));
        assert_eq!(rb.find(key), rc.find(key));
    }
}

#[tokio::test]
async fn ring_holds_each_node_at_rfactor_positions() {
    let (a_kernel, a) = start_node("a", "c").await;
    let (_b_kernel, b) = start_node("b", "c").await;

    b.meet(&a_kernel.node()).await.unwrap();
    let expected: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    wait_for_members(&a, &expected).await;

    let ring = a.ring().await;
    assert_eq!(ring.size(), 6);
    for id in ["a", "b"] {
        assert_eq!(ring.weights().get(id), Some(&3));
    }
}

#[tokio::test]
async fn leave_on_single_node_ring_is_synchronous() {
    let (_kernel, gossip) = start_node("solo", "c").await;
    let mut events = gossip.events();

    gossip.leave(false).await.unwrap();

    assert_eq!(events.recv().await.unwrap(), GossipEvent::Leave);
    assert_eq!(events.recv().await.unwrap(), GossipEvent::Close);
}

#[tokio::test]
async fn removed_node_disappears_from_peers() {
    let (a_kernel, a) = start_node("a", "c").await;
    let (b_kernel, b) = start_node("b", "c").await;
    let (_c_kernel, c) = start_node("c", "c").await;

    b.meet(&a_kernel.node()).await.unwrap();
    c.meet(&a_kernel.node()).await.unwrap();
    let all: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    wait_for_members(&a, &all).await;
    wait_for_members(&b, &all).await;
    wait_for_members(&c, &all).await;

    a.remove(&b_kernel.node(), true).await.unwrap();

    let rest: HashSet<String> = ["a", "c"].iter().map(|s| s.to_string()).collect();
    wait_for_members(&a, &rest).await;
    wait_for_members(&c, &rest).await;
}
