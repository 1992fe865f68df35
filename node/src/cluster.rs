//! Cluster node lifecycle.
//!
//! `ClusterNode` binds a kernel, a gossip service, and the command handler
//! into one start/stop unit: restore persisted ring state, guard against a
//! ring id mismatch, bring the pieces up in order, and surface the kernel's
//! ready signal.

use crate::command::{CommandHandler, COMMAND_HANDLER_ID};
use crate::error::{NodeError, NodeResult};
use clique_gossip::Gossip;
use clique_network::{Handler, HandlerConfig, NetKernel};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use tokio::sync::watch;
use tracing::info;

/// A full cluster node: kernel + gossip + command handler.
pub struct ClusterNode {
    kernel: NetKernel,
    gossip: Gossip,
    command: StdRwLock<Option<Handler>>,
    restored_ring_id: Mutex<Option<String>>,
}

impl ClusterNode {
    /// Composes a node from its kernel and gossip service. Nothing runs
    /// until [`start`](Self::start).
    pub fn new(kernel: NetKernel, gossip: Gossip) -> Self {
        Self {
            kernel,
            gossip,
            command: StdRwLock::new(None),
            restored_ring_id: Mutex::new(None),
        }
    }

    /// The node's kernel.
    pub fn kernel(&self) -> &NetKernel {
        &self.kernel
    }

    /// The node's gossip service.
    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// Watch flag that turns true once the kernel is listening.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.kernel.ready()
    }

    /// Restores persisted ring state and opens connections to every
    /// restored peer.
    pub async fn load(&self) -> NodeResult<()> {
        let restored = self.gossip.restore().await?;
        if let Ok(mut slot) = self.restored_ring_id.lock() {
            *slot = restored;
        }
        let me = self.kernel.node();
        for node in self.gossip.nodes().await {
            if node != me {
                self.kernel.connect(&node).await;
            }
        }
        Ok(())
    }

    /// Starts the command handler, gossip under `ring_id`, and finally the
    /// kernel with `cookie`. Fails with [`NodeError::RingMismatch`] when a
    /// restored ring id disagrees with the configured one.
    pub async fn start(&self, cookie: Option<String>, ring_id: &str) -> NodeResult<()> {
        let restored = self
            .restored_ring_id
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(restored) = restored {
            if restored != ring_id {
                return Err(NodeError::RingMismatch {
                    restored,
                    configured: ring_id.to_string(),
                });
            }
        }

        let command = Handler::new(
            self.kernel.clone(),
            HandlerConfig::default(),
            Arc::new(CommandHandler::new(self.gossip.clone())),
        );
        command.start(Some(COMMAND_HANDLER_ID))?;
        if let Ok(mut slot) = self.command.write() {
            *slot = Some(command);
        }

        self.gossip.start(ring_id).await?;
        self.kernel.start(cookie).await?;
        info!(node = %self.kernel.node(), ring_id, "cluster node started");
        Ok(())
    }

    /// Stops command handler, gossip, and kernel in that order, closing
    /// every sink.
    pub async fn stop(&self, force: bool) {
        let command = self
            .command
            .write()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(command) = command {
            command.stop(force).await;
        }
        self.gossip.stop(force).await;
        self.kernel.stop(force).await;
        info!(node = %self.kernel.node(), "cluster node stopped");
    }
}
