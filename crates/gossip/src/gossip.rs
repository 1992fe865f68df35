//! The gossip service.
//!
//! Each node owns one `Gossip` per ring id: a consistent hash ring, a vector
//! clock, and the reconciliation protocol that converges both across peers.
//! Ring messages ride the handler runtime under the ring id, so nodes with
//! different ring ids never intermix.

use crate::config::{GossipConfig, GOSSIP_FANOUT};
use crate::error::{GossipError, GossipResult};
use crate::messages::{RingMsg, RingMsgKind};
use crate::store::{RingSnapshot, RingStore};
use async_trait::async_trait;
use clique_core::{monotonic_us, HashRing, Node, VectorClock};
use clique_network::{
    decode_job_value, EventHandler, Handler, HandlerConfig, Job, NetKernel, NetworkError,
    NetworkResult, Origin, Target,
};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle notifications from the gossip service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipEvent {
    /// This node has said farewell to the ring
    Leave,
    /// The gossip service is done
    Close,
}

enum PendingOp {
    Insert(Node),
    Remove(Node, bool),
}

struct GossipState {
    ring: HashRing,
    clock: VectorClock,
    actor: String,
    ring_id: Option<String>,
}

struct GossipInner {
    config: GossipConfig,
    kernel: NetKernel,
    store: Option<Arc<dyn RingStore>>,
    handler: StdRwLock<Option<Handler>>,
    state: Mutex<GossipState>,
    pending: Mutex<VecDeque<PendingOp>>,
    events: broadcast::Sender<GossipEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Handle to a node's gossip service. Cheap to clone.
#[derive(Clone)]
pub struct Gossip {
    inner: Arc<GossipInner>,
}

/// Rounds needed for fanout-2 gossip to cover the ring.
fn max_msg_round(ring: &HashRing) -> u32 {
    let size = ring.size();
    let rfactor = ring.rfactor() as usize;
    if size <= rfactor {
        return 1;
    }
    ((size as f64) / (rfactor as f64)).log2().ceil() as u32
}

impl Gossip {
    /// Creates a gossip service over `kernel`. The ring is empty until
    /// [`start`](Self::start) or [`restore`](Self::restore) populates it.
    pub fn new(kernel: NetKernel, config: GossipConfig, store: Option<Arc<dyn RingStore>>) -> Self {
        let (events, _) = broadcast::channel(16);
        let state = GossipState {
            ring: HashRing::new(config.rfactor, config.pfactor),
            clock: VectorClock::new(),
            actor: Uuid::new_v4().to_string(),
            ring_id: None,
        };
        Self {
            inner: Arc::new(GossipInner {
                config,
                kernel,
                store,
                handler: StdRwLock::new(None),
                state: Mutex::new(state),
                pending: Mutex::new(VecDeque::new()),
                events,
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribes to gossip lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<GossipEvent> {
        self.inner.events.subscribe()
    }

    /// The kernel this service gossips over.
    pub fn kernel(&self) -> &NetKernel {
        &self.inner.kernel
    }

    fn handler(&self) -> GossipResult<Handler> {
        self.inner
            .handler
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(GossipError::NotStarted)
    }

    /// Whether no gossip streams are in flight.
    pub fn idle(&self) -> bool {
        self.handler().map(|h| h.idle()).unwrap_or(true)
    }

    /// Snapshot of the current ring.
    pub async fn ring(&self) -> HashRing {
        self.inner.state.lock().await.ring.clone()
    }

    /// Distinct nodes in the current ring.
    pub async fn nodes(&self) -> Vec<Node> {
        self.inner.state.lock().await.ring.nodes()
    }

    /// The actor the node currently gossips under.
    pub async fn actor(&self) -> String {
        self.inner.state.lock().await.actor.clone()
    }

    /// The ring id, once started.
    pub async fn ring_id(&self) -> Option<String> {
        self.inner.state.lock().await.ring_id.clone()
    }

    /// The owner of `data` followed by its ring neighbors.
    pub async fn find(&self, data: &str) -> Vec<Node> {
        let state = self.inner.state.lock().await;
        let Some(owner) = state.ring.find(data).cloned() else {
            return Vec::new();
        };
        let mut result = vec![owner.clone()];
        result.extend(state.ring.next(&owner, None));
        result
    }

    /// Up to `k` distinct replica nodes for `data`, the owner first.
    pub async fn range(&self, data: &str, k: usize) -> Vec<Node> {
        self.inner.state.lock().await.ring.range_next(data, k)
    }

    /// Restores persisted state, returning the restored ring id.
    pub async fn restore(&self) -> GossipResult<Option<String>> {
        let Some(store) = &self.inner.store else {
            return Ok(None);
        };
        let Some(snapshot) = store.load().await? else {
            return Ok(None);
        };
        info!(ring_id = %snapshot.ring_id, "restored gossip state");
        let mut state = self.inner.state.lock().await;
        state.ring = snapshot.ring;
        state.clock = snapshot.clock;
        state.actor = snapshot.actor;
        Ok(Some(snapshot.ring_id))
    }

    /// Joins the handler under `ring_id`, makes sure this node is in its own
    /// ring, and starts the poll and flush loops.
    pub async fn start(&self, ring_id: &str) -> GossipResult<()> {
        let me = self.inner.kernel.node();
        {
            let mut state = self.inner.state.lock().await;
            state.ring_id = Some(ring_id.to_string());
            state.ring.insert(&me, None);
        }

        let handler = Handler::new(
            self.inner.kernel.clone(),
            HandlerConfig::default(),
            Arc::new(self.clone()),
        );
        handler.start(Some(ring_id))?;
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(handler);
        }

        let poller = self.clone();
        let poll_interval = self.inner.config.interval;
        let poll_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poller.poll_once().await;
            }
        });

        let flusher = self.clone();
        let flush_interval = self.inner.config.flush_interval;
        let flush_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                flusher.flush_once().await;
            }
        });

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(poll_task);
            tasks.push(flush_task);
        }
        info!(ring_id, node = %me, "gossip started");
        Ok(())
    }

    /// Stops the loops and the handler.
    pub async fn stop(&self, force: bool) {
        self.abort_tasks();
        let handler = self
            .inner
            .handler
            .write()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handler) = handler {
            handler.stop(force).await;
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Introduces this node to `node`: opens a connection and casts a join
    /// carrying our ring under a fresh actor. Our own clock is untouched;
    /// the receiving side bumps it for us.
    pub async fn meet(&self, node: &Node) -> GossipResult<()> {
        let handler = self.handler()?;
        self.inner.kernel.connect(node).await;
        let msg = {
            let state = self.inner.state.lock().await;
            RingMsg {
                kind: RingMsgKind::Join,
                actor: Uuid::new_v4().to_string(),
                data: state.ring.clone(),
                vclock: state.clock.clone(),
                round: 0,
            }
        };
        let value = serde_json::to_value(&msg).map_err(NetworkError::codec)?;
        handler
            .cast(
                Target::Remote {
                    node: node.clone(),
                    id: handler.id(),
                },
                "ring",
                &value,
            )
            .await?;
        Ok(())
    }

    /// Adds `node` to the ring and broadcasts the change. Deferred until
    /// idle unless `force`.
    pub async fn insert(&self, node: &Node, force: bool) -> GossipResult<()> {
        if !self.idle() && !force {
            self.inner
                .pending
                .lock()
                .await
                .push_back(PendingOp::Insert(node.clone()));
            return Ok(());
        }
        self.apply_insert(std::slice::from_ref(node)).await
    }

    /// Adds several nodes in one clock bump.
    pub async fn minsert(&self, nodes: &[Node], force: bool) -> GossipResult<()> {
        if !self.idle() && !force {
            let mut pending = self.inner.pending.lock().await;
            for node in nodes {
                pending.push_back(PendingOp::Insert(node.clone()));
            }
            return Ok(());
        }
        self.apply_insert(nodes).await
    }

    /// Removes `node` from the ring and broadcasts the change. Deferred
    /// until idle unless `force`.
    pub async fn remove(&self, node: &Node, force: bool) -> GossipResult<()> {
        if !self.idle() && !force {
            self.inner
                .pending
                .lock()
                .await
                .push_back(PendingOp::Remove(node.clone(), force));
            return Ok(());
        }
        self.apply_remove(std::slice::from_ref(node), force).await
    }

    /// Removes several nodes in one clock bump.
    pub async fn mremove(&self, nodes: &[Node], force: bool) -> GossipResult<()> {
        if !self.idle() && !force {
            let mut pending = self.inner.pending.lock().await;
            for node in nodes {
                pending.push_back(PendingOp::Remove(node.clone(), force));
            }
            return Ok(());
        }
        self.apply_remove(nodes, force).await
    }

    async fn apply_insert(&self, nodes: &[Node]) -> GossipResult<()> {
        let round = {
            let mut state = self.inner.state.lock().await;
            for node in nodes {
                state.ring.insert(node, None);
            }
            let actor = Uuid::new_v4().to_string();
            state.clock.increment(&actor);
            state.actor = actor;
            max_msg_round(&state.ring)
        };
        for node in nodes {
            self.inner.kernel.connect(node).await;
        }
        self.send_ring(RingMsgKind::Update, round).await;
        Ok(())
    }

    async fn apply_remove(&self, nodes: &[Node], force: bool) -> GossipResult<()> {
        let round = {
            let mut state = self.inner.state.lock().await;
            for node in nodes {
                state.ring.remove(node);
            }
            let actor = Uuid::new_v4().to_string();
            state.clock.increment(&actor);
            state.actor = actor;
            max_msg_round(&state.ring)
        };
        for node in nodes {
            self.inner.kernel.disconnect(node, force).await;
        }
        self.send_ring(RingMsgKind::Update, round).await;
        Ok(())
    }

    /// Force-merges an externally supplied ring, feeding it through the
    /// join-merge path so the change also fans out.
    pub async fn update(&self, ring: HashRing) -> GossipResult<()> {
        let msg = RingMsg {
            kind: RingMsgKind::Join,
            actor: Uuid::new_v4().to_string(),
            data: ring,
            vclock: VectorClock::new(),
            round: 0,
        };
        self.update_ring(msg).await;
        Ok(())
    }

    /// Says farewell to the ring. On a ring that only holds this node, the
    /// leave completes synchronously with no broadcast.
    pub async fn leave(&self, force: bool) -> GossipResult<()> {
        let handler = self.handler()?;
        handler.pause();
        self.abort_tasks();

        let me = self.inner.kernel.node();
        let alone = {
            let state = self.inner.state.lock().await;
            state.ring.size() <= state.ring.rfactor() as usize
        };
        if alone {
            let _ = self.inner.events.send(GossipEvent::Leave);
            let _ = self.inner.events.send(GossipEvent::Close);
            return Ok(());
        }

        if !force {
            handler.wait_idle().await;
        }

        let (msg, peers) = {
            let mut state = self.inner.state.lock().await;
            let actor = Uuid::new_v4().to_string();
            state.clock.increment(&actor);
            state.actor = actor.clone();

            let mut farewell = state.ring.clone();
            farewell.remove(&me);
            let round = max_msg_round(&state.ring).saturating_sub(1);
            let peers = pick_peers(&farewell, &me);
            (
                RingMsg {
                    kind: RingMsgKind::Leave,
                    actor,
                    data: farewell,
                    vclock: state.clock.clone(),
                    round,
                },
                peers,
            )
        };

        if let Ok(value) = serde_json::to_value(&msg) {
            let _ = handler.abcast(&peers, "ring", &value).await;
        }
        for node in self.inner.kernel.sinks().await {
            self.inner.kernel.disconnect(&node, true).await;
        }
        let _ = self.inner.events.send(GossipEvent::Close);
        Ok(())
    }

    /// One gossip round: drain deferred mutations if idle, trim the clock,
    /// and send the current ring to a couple of peers.
    async fn poll_once(&self) {
        if self.idle() {
            let ops: Vec<PendingOp> = {
                let mut pending = self.inner.pending.lock().await;
                pending.drain(..).collect()
            };
            for op in ops {
                let result = match op {
                    PendingOp::Insert(node) => {
                        self.apply_insert(std::slice::from_ref(&node)).await
                    }
                    PendingOp::Remove(node, force) => {
                        self.apply_remove(std::slice::from_ref(&node), force).await
                    }
                };
                if let Err(e) = result {
                    warn!("deferred ring mutation failed: {e}");
                }
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            let opts = self.inner.config.vclock_opts;
            state.clock.trim(monotonic_us(), &opts);
        }
        self.send_ring(RingMsgKind::Update, 1).await;
    }

    async fn flush_once(&self) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let snapshot = {
            let state = self.inner.state.lock().await;
            let Some(ring_id) = state.ring_id.clone() else {
                return;
            };
            RingSnapshot {
                ring_id,
                actor: state.actor.clone(),
                ring: state.ring.clone(),
                clock: state.clock.clone(),
            }
        };
        if let Err(e) = store.save(snapshot).await {
            warn!("ring flush failed: {e}");
        }
    }

    async fn send_ring(&self, kind: RingMsgKind, round: u32) {
        let Ok(handler) = self.handler() else {
            return;
        };
        let me = self.inner.kernel.node();
        let (msg, peers) = {
            let state = self.inner.state.lock().await;
            let peers = pick_peers(&state.ring, &me);
            let msg = RingMsg {
                kind,
                actor: state.actor.clone(),
                data: state.ring.clone(),
                vclock: state.clock.clone(),
                round,
            };
            (msg, peers)
        };
        if peers.is_empty() {
            return;
        }
        match serde_json::to_value(&msg) {
            Ok(value) => {
                let _ = handler.abcast(&peers, "ring", &value).await;
            }
            Err(e) => warn!("could not encode ring message: {e}"),
        }
    }

    /// Reconciles one inbound ring message.
    async fn update_ring(&self, msg: RingMsg) {
        let me = self.inner.kernel.node();
        let (added, removed, rebroadcast) = {
            let mut state = self.inner.state.lock().await;
            let old_nodes = state.ring.nodes();

            match msg.kind {
                RingMsgKind::Join => {
                    state.clock.merge(&msg.vclock);
                    if let Err(e) = state.ring.merge(&msg.data) {
                        warn!("rejecting join with mismatched ring params: {e}");
                        return;
                    }
                }
                RingMsgKind::Update | RingMsgKind::Leave => {
                    if msg.vclock.descends_strictly(&state.clock) {
                        // The sender has seen everything we have; take its view.
                        state.ring = msg.data.clone();
                        state.clock = msg.vclock.clone();
                    } else if !state.clock.descends(&msg.vclock) {
                        // Divergent histories: last writer wins on insertion
                        // time, ties keep the local ring.
                        if msg.vclock.max_insert_time() > state.clock.max_insert_time() {
                            state.ring = msg.data.clone();
                        }
                        state.clock.merge(&msg.vclock);
                    }
                }
            }

            state.clock.increment(&msg.actor);
            state.actor = msg.actor.clone();

            let new_nodes = state.ring.nodes();
            let added: Vec<Node> = match msg.kind {
                RingMsgKind::Join => msg
                    .data
                    .nodes()
                    .into_iter()
                    .filter(|n| *n != me)
                    .collect(),
                _ => new_nodes
                    .iter()
                    .filter(|n| !old_nodes.contains(n) && **n != me)
                    .cloned()
                    .collect(),
            };
            let removed: Vec<Node> = old_nodes
                .iter()
                .filter(|n| !new_nodes.contains(n) && **n != me)
                .cloned()
                .collect();

            let rebroadcast = match msg.kind {
                RingMsgKind::Join => Some(max_msg_round(&state.ring)),
                _ if msg.round == 0 => None,
                _ => Some(msg.round - 1),
            };
            (added, removed, rebroadcast)
        };

        for node in &added {
            self.inner.kernel.connect(node).await;
        }
        for node in &removed {
            self.inner.kernel.disconnect(node, true).await;
        }
        if let Some(round) = rebroadcast {
            self.send_ring(RingMsgKind::Update, round).await;
        }
    }
}

/// Samples up to the gossip fanout of peers, excluding `me`.
fn pick_peers(ring: &HashRing, me: &Node) -> Vec<Node> {
    let others: Vec<Node> = ring.nodes().into_iter().filter(|n| n != me).collect();
    let mut rng = rand::thread_rng();
    others
        .choose_multiple(&mut rng, GOSSIP_FANOUT)
        .cloned()
        .collect()
}

#[async_trait]
impl EventHandler for Gossip {
    fn decode_parsed(&self, value: Value) -> NetworkResult<Job> {
        let job = decode_job_value(value)?;
        if job.event != "ring" {
            return Err(NetworkError::invalid_job(format!(
                "unknown gossip event {}",
                job.event
            )));
        }
        serde_json::from_value::<RingMsg>(job.data.clone())
            .map_err(NetworkError::invalid_job)?;
        Ok(job)
    }

    async fn handle(&self, _handler: Handler, event: String, data: Value, _from: Origin) {
        if event != "ring" {
            return;
        }
        let msg = match serde_json::from_value::<RingMsg>(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping malformed ring message: {e}");
                return;
            }
        };
        self.update_ring(msg).await;
    }
}
