//! Cluster node lifecycle and command surface.

use async_trait::async_trait;
use clique_core::{HashRing, Node, VectorClock};
use clique_gossip::{Gossip, GossipConfig, MemRingStore, RingSnapshot, RingStore};
use clique_network::{
    EventHandler, Handler, HandlerConfig, KernelConfig, NetKernel, Origin, Target,
};
use clique_node::{ClusterNode, NodeError, COMMAND_HANDLER_ID};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Mute;

#[async_trait]
impl EventHandler for Mute {
    async fn handle(&self, _handler: Handler, _event: String, _data: Value, _from: Origin) {}
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("clique_node=debug")
        .try_init();
}

fn build_node(id: &str, store: Option<Arc<dyn RingStore>>) -> ClusterNode {
    init_tracing();
    let port = free_port();
    let config = KernelConfig::new("127.0.0.1", port).with_retry(Duration::from_millis(20));
    let kernel = NetKernel::new(Node::new(id, "127.0.0.1", port), config);
    let gossip = Gossip::new(
        kernel.clone(),
        GossipConfig::default().with_interval(Duration::from_millis(100)),
        store,
    );
    ClusterNode::new(kernel, gossip)
}

#[tokio::test]
async fn two_nodes_start_meet_and_serve_commands() {
    let a = build_node("a", None);
    let b = build_node("b", None);

    a.start(Some("c".to_string()), "r").await.unwrap();
    b.start(Some("c".to_string()), "r").await.unwrap();
    assert!(*a.ready().borrow());

    b.gossip().meet(&a.kernel().node()).await.unwrap();

    let expected: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
    for _ in 0..100 {
        let have: HashSet<String> = b
            .gossip()
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

    let caller = Handler::new(
        b.kernel().clone(),
        HandlerConfig::default(),
        Arc::new(Mute),
    );
    caller.start(None).unwrap();

    let reply = caller
        .call(
            Target::Remote {
                node: a.kernel().node(),
                id: COMMAND_HANDLER_ID.to_string(),
            },
            "ping",
            &Value::Null,
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert_eq!(reply, b"\"pong\"");

    let reply = caller
        .call(
            Target::Remote {
                node: a.kernel().node(),
                id: COMMAND_HANDLER_ID.to_string(),
            },
            "nodes",
            &Value::Null,
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    let nodes: Vec<Node> = serde_json::from_slice(&reply).unwrap();
    let have: HashSet<String> = nodes.iter().map(|n| n.id().to_string()).collect();
    assert_eq!(have, expected);

    a.stop(true).await;
    b.stop(true).await;
}

#[tokio::test]
async fn restored_ring_id_must_match() {
    let store = Arc::new(MemRingStore::new());
    store
        .save(RingSnapshot {
            ring_id: "old".to_string(),
            actor: "actor".to_string(),
            ring: HashRing::new(3, 2),
            clock: VectorClock::new(),
        })
        .await
        .unwrap();

    let node = build_node("a", Some(store));
    node.load().await.unwrap();

    let err = node.start(None, "new").await.unwrap_err();
    assert_eq!(
        err,
        NodeError::RingMismatch {
            restored: "old".to_string(),
            configured: "new".to_string(),
        }
    );
}

#[tokio::test]
async fn matching_restored_ring_id_starts_cleanly() {
    let store = Arc::new(MemRingStore::new());
    store
        .save(RingSnapshot {
            ring_id: "r".to_string(),
            actor: "actor".to_string(),
            ring: HashRing::new(3, 2),
            clock: VectorClock::new(),
        })
        .await
        .unwrap();

    let node = build_node("a", Some(store));
    node.load().await.unwrap();
    node.start(None, "r").await.unwrap();
    assert_eq!(node.gossip().ring_id().await.as_deref(), Some("r"));
    node.stop(true).await;
}
