//! Cluster command handler.
//!
//! A handler registered under `"command"` on every node, translating
//! administrative events into gossip operations and ring queries. This is
//! the surface remote tooling talks to; the interactive shell that drives it
//! lives outside this workspace.

use async_trait::async_trait;
use clique_core::{HashRing, Node};
use clique_gossip::Gossip;
use clique_network::{
    decode_job_value, EventHandler, Handler, Job, NetworkError, NetworkResult, Origin,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Handler id the command surface registers under.
pub const COMMAND_HANDLER_ID: &str = "command";

#[derive(Debug, Deserialize)]
struct NodeCmd {
    node: Node,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct NodesCmd {
    nodes: Vec<Node>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct IdCmd {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ForceCmd {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct RingCmd {
    ring: HashRing,
}

/// Serves the reserved cluster command events.
pub struct CommandHandler {
    gossip: Gossip,
}

impl CommandHandler {
    pub fn new(gossip: Gossip) -> Self {
        Self { gossip }
    }

    async fn dispatch(&self, event: &str, data: Value) -> Option<Value> {
        match event {
            "ping" => Some(json!("pong")),
            "nodes" => {
                let nodes = self.gossip.nodes().await;
                serde_json::to_value(nodes).ok()
            }
            "inspect" => {
                let ring = self.gossip.ring().await;
                Some(json!({
                    "ringId": self.gossip.ring_id().await,
                    "actor": self.gossip.actor().await,
                    "size": ring.size(),
                    "nodes": ring.nodes(),
                }))
            }
            "has" => {
                let cmd: IdCmd = serde_json::from_value(data).ok()?;
                let present = self
                    .gossip
                    .nodes()
                    .await
                    .iter()
                    .any(|n| n.id() == cmd.id);
                Some(json!(present))
            }
            "get" => {
                let cmd: IdCmd = serde_json::from_value(data).ok()?;
                let found = self
                    .gossip
                    .nodes()
                    .await
                    .into_iter()
                    .find(|n| n.id() == cmd.id);
                serde_json::to_value(found).ok()
            }
            "weight" => {
                let cmd: IdCmd = serde_json::from_value(data).ok()?;
                let ring = self.gossip.ring().await;
                Some(json!(ring.weights().get(&cmd.id).copied()))
            }
            "weights" => {
                let ring = self.gossip.ring().await;
                serde_json::to_value(ring.weights()).ok()
            }
            "meet" | "join" => {
                let cmd: NodeCmd = serde_json::from_value(data).ok()?;
                Some(ok_reply(self.gossip.meet(&cmd.node).await))
            }
            "insert" => {
                let cmd: NodeCmd = serde_json::from_value(data).ok()?;
                Some(ok_reply(self.gossip.insert(&cmd.node, cmd.force).await))
            }
            "minsert" => {
                let cmd: NodesCmd = serde_json::from_value(data).ok()?;
                Some(ok_reply(self.gossip.minsert(&cmd.nodes, cmd.force).await))
            }
            "remove" => {
                let cmd: NodeCmd = serde_json::from_value(data).ok()?;
                Some(ok_reply(self.gossip.remove(&cmd.node, cmd.force).await))
            }
            "mremove" => {
                let cmd: NodesCmd = serde_json::from_value(data).ok()?;
                Some(ok_reply(self.gossip.mremove(&cmd.nodes, cmd.force).await))
            }
            "leave" => {
                let cmd: ForceCmd = serde_json::from_value(data).unwrap_or(ForceCmd {
                    force: false,
                });
                Some(ok_reply(self.gossip.leave(cmd.force).await))
            }
            "update" => {
                let cmd: RingCmd = serde_json::from_value(data).ok()?;
                Some(ok_reply(self.gossip.update(cmd.ring).await))
            }
            other => {
                debug!(event = other, "unknown command");
                None
            }
        }
    }
}

fn ok_reply<E: std::fmt::Display>(result: Result<(), E>) -> Value {
    match result {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

#[async_trait]
impl EventHandler for CommandHandler {
    fn decode_parsed(&self, value: Value) -> NetworkResult<Job> {
        let job = decode_job_value(value)?;
        const EVENTS: &[&str] = &[
            "join", "leave", "meet", "insert", "minsert", "remove", "mremove", "inspect",
            "nodes", "has", "get", "ping", "weight", "weights", "update",
        ];
        if !EVENTS.contains(&job.event.as_str()) {
            return Err(NetworkError::invalid_job(format!(
                "unknown command {}",
                job.event
            )));
        }
        Ok(job)
    }

    async fn handle(&self, handler: Handler, event: String, data: Value, from: Origin) {
        let Some(reply) = self.dispatch(&event, data).await else {
            return;
        };
        if from.tag.is_some() {
            let _ = handler.reply(&from, &reply).await;
        }
    }
}
