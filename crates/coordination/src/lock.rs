//! Distributed lock manager.
//!
//! Redlock-style quorum locks over the replica set the ring assigns to each
//! lock id. Acquisition multicalls every replica and succeeds when the
//! granting fraction reaches the configured quorum before the TTL elapses;
//! failed rounds roll their partial grants back and retry after a
//! uniform-random back-off. Each replica keeps per-holder expiry timers, so
//! an abandoned lock drains by itself.

use crate::config::LockConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::table::{Table, TableValue};
use async_trait::async_trait;
use clique_core::{monotonic_us, Node};
use clique_gossip::Gossip;
use clique_network::{
    decode_job_value, EventHandler, Handler, HandlerConfig, Job, NetworkError, NetworkResult,
    Origin,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lock compatibility class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Shared; any number of holders
    Read,
    /// Exclusive; at most one holder
    Write,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockReq {
    id: String,
    holder: String,
    /// TTL in milliseconds.
    timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnlockReq {
    id: String,
    holder: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OkResp {
    ok: bool,
}

struct LockEntry {
    kind: LockKind,
    holders: HashMap<String, JoinHandle<()>>,
}

struct LockInner {
    config: LockConfig,
    gossip: Gossip,
    handler: StdRwLock<Option<Handler>>,
    locks: Mutex<HashMap<String, LockEntry>>,
    table: Option<Arc<dyn Table>>,
}

/// Handle to a node's lock manager. Cheap to clone.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockInner>,
}

impl LockManager {
    /// Creates a lock manager over `gossip`. A `Some` table mirrors grants
    /// so lock state survives a restart.
    pub fn new(gossip: Gossip, config: LockConfig, table: Option<Arc<dyn Table>>) -> Self {
        Self {
            inner: Arc::new(LockInner {
                config,
                gossip,
                handler: StdRwLock::new(None),
                locks: Mutex::new(HashMap::new()),
                table,
            }),
        }
    }

    fn handler(&self) -> CoordinationResult<Handler> {
        self.inner
            .handler
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(CoordinationError::NotStarted)
    }

    /// Rebuilds durable state and registers the handler under `name`. The
    /// name must match across the cluster.
    pub async fn start(&self, name: &str) -> CoordinationResult<()> {
        self.rebuild_from_table().await?;
        let handler = Handler::new(
            self.inner.gossip.kernel().clone(),
            HandlerConfig::default(),
            Arc::new(self.clone()),
        );
        handler.start(Some(name))?;
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(handler);
        }
        Ok(())
    }

    /// Stops the handler and cancels every expiry timer.
    pub async fn stop(&self, force: bool) {
        let handler = self
            .inner
            .handler
            .write()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(handler) = handler {
            handler.stop(force).await;
        }
        let mut locks = self.inner.locks.lock().await;
        for (_, entry) in locks.drain() {
            for (_, timer) in entry.holders {
                timer.abort();
            }
        }
    }

    /// Acquires a shared lock on `id` for `holder`. `retries` of `None`
    /// retries forever; `Some(0)` fails on the first missed quorum. Returns
    /// the replicas that granted.
    pub async fn rlock(
        &self,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        retries: Option<u32>,
    ) -> CoordinationResult<Vec<Node>> {
        self.acquire(LockKind::Read, id, holder, ttl_ms, retries)
            .await
    }

    /// Acquires an exclusive lock on `id` for `holder`.
    pub async fn wlock(
        &self,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        retries: Option<u32>,
    ) -> CoordinationResult<Vec<Node>> {
        self.acquire(LockKind::Write, id, holder, ttl_ms, retries)
            .await
    }

    /// Releases a shared lock on every given replica, returning those that
    /// acknowledged.
    pub async fn runlock(
        &self,
        nodes: &[Node],
        id: &str,
        holder: &str,
    ) -> CoordinationResult<Vec<Node>> {
        self.release(LockKind::Read, nodes, id, holder).await
    }

    /// Releases an exclusive lock on every given replica.
    pub async fn wunlock(
        &self,
        nodes: &[Node],
        id: &str,
        holder: &str,
    ) -> CoordinationResult<Vec<Node>> {
        self.release(LockKind::Write, nodes, id, holder).await
    }

    /// Fire-and-forget shared release to all replicas of `id`.
    pub async fn runlock_async(&self, id: &str, holder: &str) {
        self.release_async(LockKind::Read, id, holder).await;
    }

    /// Fire-and-forget exclusive release to all replicas of `id`.
    pub async fn wunlock_async(&self, id: &str, holder: &str) {
        self.release_async(LockKind::Write, id, holder).await;
    }

    /// The kind and holders of a local lock entry, for inspection.
    pub async fn inspect(&self, id: &str) -> Option<(LockKind, Vec<String>)> {
        let locks = self.inner.locks.lock().await;
        locks.get(id).map(|entry| {
            let mut holders: Vec<String> = entry.holders.keys().cloned().collect();
            holders.sort();
            (entry.kind, holders)
        })
    }

    async fn acquire(
        &self,
        kind: LockKind,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        mut retries: Option<u32>,
    ) -> CoordinationResult<Vec<Node>> {
        let handler = self.handler()?;
        let event = match kind {
            LockKind::Read => "rlock",
            LockKind::Write => "wlock",
        };
        let quorum = match kind {
            LockKind::Read => self.inner.config.rquorum,
            LockKind::Write => self.inner.config.wquorum,
        };
        let req = json!({ "id": id, "holder": holder, "timeout": ttl_ms });

        loop {
            let nodes = self
                .inner
                .gossip
                .range(id, self.inner.config.rfactor)
                .await;
            if nodes.is_empty() {
                return Err(CoordinationError::NoReplicas { id: id.to_string() });
            }

            let t0 = monotonic_us();
            let replies = handler
                .multicall(&nodes, event, &req, Some(self.inner.config.request_timeout))
                .await;
            let delta_ms = monotonic_us().saturating_sub(t0) / 1000;

            let mut passes = Vec::new();
            for (node, reply) in nodes.iter().zip(replies) {
                match reply {
                    Ok(bytes) => match serde_json::from_slice::<OkResp>(&bytes) {
                        Ok(resp) if resp.ok => passes.push(node.clone()),
                        Ok(_) => {}
                        Err(e) => debug!(peer = %node, "unreadable lock reply: {e}"),
                    },
                    Err(e) => debug!(peer = %node, "lock call failed: {e}"),
                }
            }

            if passes.len() as f64 / nodes.len() as f64 >= quorum && delta_ms < ttl_ms {
                return Ok(passes);
            }

            // Roll back whatever was granted before backing off.
            self.release_async(kind, id, holder).await;

            if let Some(n) = retries.as_mut() {
                if *n == 0 {
                    return Err(CoordinationError::QuorumFailure { id: id.to_string() });
                }
                *n -= 1;
            }
            let delay = self.backoff_delay();
            tokio::time::sleep(delay).await;
        }
    }

    async fn release(
        &self,
        kind: LockKind,
        nodes: &[Node],
        id: &str,
        holder: &str,
    ) -> CoordinationResult<Vec<Node>> {
        let handler = self.handler()?;
        let event = match kind {
            LockKind::Read => "runlock",
            LockKind::Write => "wunlock",
        };
        let req = json!({ "id": id, "holder": holder });
        let replies = handler
            .multicall(nodes, event, &req, Some(self.inner.config.request_timeout))
            .await;
        let mut passes = Vec::new();
        for (node, reply) in nodes.iter().zip(replies) {
            if let Ok(bytes) = reply {
                if let Ok(OkResp { ok: true }) = serde_json::from_slice::<OkResp>(&bytes) {
                    passes.push(node.clone());
                }
            }
        }
        Ok(passes)
    }

    async fn release_async(&self, kind: LockKind, id: &str, holder: &str) {
        let Ok(handler) = self.handler() else {
            return;
        };
        let event = match kind {
            LockKind::Read => "runlock",
            LockKind::Write => "wunlock",
        };
        let nodes = self
            .inner
            .gossip
            .range(id, self.inner.config.rfactor)
            .await;
        let req = json!({ "id": id, "holder": holder });
        let _ = handler.abcast(&nodes, event, &req).await;
    }

    fn backoff_delay(&self) -> Duration {
        let min = self.inner.config.min_wait_timeout.as_millis() as u64;
        let max = self.inner.config.max_wait_timeout.as_millis() as u64;
        let ms = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    fn spawn_expiry(&self, id: String, holder: String, ttl_ms: u64) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            manager.expire(&id, &holder).await;
        })
    }

    async fn expire(&self, id: &str, holder: &str) {
        let kind = {
            let mut locks = self.inner.locks.lock().await;
            let Some(entry) = locks.get_mut(id) else {
                return;
            };
            if entry.holders.remove(holder).is_none() {
                return;
            }
            let kind = entry.kind;
            if entry.holders.is_empty() {
                locks.remove(id);
            }
            kind
        };
        debug!(id, holder, "lock holder expired");
        self.mirror_release(kind, id, holder).await;
    }

    async fn mirror_grant(&self, kind: LockKind, id: &str, holder: &str, expiry_us: u64) {
        let Some(table) = &self.inner.table else {
            return;
        };
        let result = match kind {
            LockKind::Read => table.hset(id, holder, json!(expiry_us)).await,
            LockKind::Write => {
                table
                    .set(id, json!({ "holder": holder, "expiry": expiry_us }))
                    .await
            }
        };
        if let Err(e) = result {
            warn!(id, "could not mirror lock grant: {e}");
        }
    }

    async fn mirror_release(&self, kind: LockKind, id: &str, holder: &str) {
        let Some(table) = &self.inner.table else {
            return;
        };
        let result = match kind {
            LockKind::Read => table.hdel(id, holder).await,
            LockKind::Write => table.del(id).await,
        };
        if let Err(e) = result {
            warn!(id, "could not mirror lock release: {e}");
        }
    }

    async fn rebuild_from_table(&self) -> CoordinationResult<()> {
        let Some(table) = &self.inner.table else {
            return Ok(());
        };
        table.load().await?;

        let mut entries: Vec<(String, TableValue)> = Vec::new();
        table
            .for_each(&mut |key, value| entries.push((key.to_string(), value.clone())))
            .await?;

        let now = monotonic_us();
        for (id, value) in entries {
            match value {
                TableValue::Hash(holders) => {
                    for (holder, expiry) in holders {
                        let expiry_us = expiry.as_u64().unwrap_or(0);
                        self.reinstate(LockKind::Read, &id, &holder, expiry_us, now)
                            .await;
                    }
                }
                TableValue::Scalar(value) => {
                    let holder = value["holder"].as_str().unwrap_or_default().to_string();
                    let expiry_us = value["expiry"].as_u64().unwrap_or(0);
                    if !holder.is_empty() {
                        self.reinstate(LockKind::Write, &id, &holder, expiry_us, now)
                            .await;
                    }
                }
                TableValue::Set(_) => {}
            }
        }
        Ok(())
    }

    /// Re-arms one restored holder with its remaining TTL, or cleans it up
    /// when it expired while the node was down.
    async fn reinstate(&self, kind: LockKind, id: &str, holder: &str, expiry_us: u64, now: u64) {
        if expiry_us <= now {
            self.mirror_release(kind, id, holder).await;
            return;
        }
        let remaining_ms = (expiry_us - now) / 1000;
        let timer = self.spawn_expiry(id.to_string(), holder.to_string(), remaining_ms.max(1));
        let mut locks = self.inner.locks.lock().await;
        let entry = locks.entry(id.to_string()).or_insert_with(|| LockEntry {
            kind,
            holders: HashMap::new(),
        });
        entry.holders.insert(holder.to_string(), timer);
    }

    async fn do_lock(&self, kind: LockKind, req: LockReq) -> bool {
        let expiry_us = monotonic_us() + req.timeout * 1000;
        let granted = {
            let mut locks = self.inner.locks.lock().await;
            match kind {
                LockKind::Read => match locks.get_mut(&req.id) {
                    Some(entry) if entry.kind == LockKind::Write => false,
                    Some(entry) => {
                        if entry.holders.contains_key(&req.holder) {
                            // Repeat request from the same holder is a success.
                            true
                        } else {
                            let timer = self.spawn_expiry(
                                req.id.clone(),
                                req.holder.clone(),
                                req.timeout,
                            );
                            entry.holders.insert(req.holder.clone(), timer);
                            true
                        }
                    }
                    None => {
                        let timer =
                            self.spawn_expiry(req.id.clone(), req.holder.clone(), req.timeout);
                        let mut holders = HashMap::new();
                        holders.insert(req.holder.clone(), timer);
                        locks.insert(
                            req.id.clone(),
                            LockEntry {
                                kind: LockKind::Read,
                                holders,
                            },
                        );
                        true
                    }
                },
                LockKind::Write => {
                    if locks.contains_key(&req.id) {
                        false
                    } else {
                        let timer =
                            self.spawn_expiry(req.id.clone(), req.holder.clone(), req.timeout);
                        let mut holders = HashMap::new();
                        holders.insert(req.holder.clone(), timer);
                        locks.insert(
                            req.id.clone(),
                            LockEntry {
                                kind: LockKind::Write,
                                holders,
                            },
                        );
                        true
                    }
                }
            }
        };
        if granted {
            self.mirror_grant(kind, &req.id, &req.holder, expiry_us).await;
        }
        granted
    }

    async fn do_unlock(&self, kind: LockKind, req: UnlockReq) -> bool {
        let released = {
            let mut locks = self.inner.locks.lock().await;
            match locks.get_mut(&req.id) {
                Some(entry) if entry.kind == kind => match entry.holders.remove(&req.holder) {
                    Some(timer) => {
                        timer.abort();
                        if entry.holders.is_empty() {
                            locks.remove(&req.id);
                        }
                        true
                    }
                    None => false,
                },
                _ => false,
            }
        };
        if released {
            self.mirror_release(kind, &req.id, &req.holder).await;
        }
        released
    }
}

#[async_trait]
impl EventHandler for LockManager {
    fn decode_parsed(&self, value: Value) -> NetworkResult<Job> {
        let job = decode_job_value(value)?;
        match job.event.as_str() {
            "rlock" | "wlock" => {
                serde_json::from_value::<LockReq>(job.data.clone())
                    .map_err(NetworkError::invalid_job)?;
            }
            "runlock" | "wunlock" => {
                serde_json::from_value::<UnlockReq>(job.data.clone())
                    .map_err(NetworkError::invalid_job)?;
            }
            other => {
                return Err(NetworkError::invalid_job(format!(
                    "unknown lock event {other}"
                )));
            }
        }
        Ok(job)
    }

    async fn handle(&self, handler: Handler, event: String, data: Value, from: Origin) {
        let granted = match event.as_str() {
            "rlock" => match serde_json::from_value::<LockReq>(data) {
                Ok(req) => Some(self.do_lock(LockKind::Read, req).await),
                Err(_) => None,
            },
            "wlock" => match serde_json::from_value::<LockReq>(data) {
                Ok(req) => Some(self.do_lock(LockKind::Write, req).await),
                Err(_) => None,
            },
            "runlock" => match serde_json::from_value::<UnlockReq>(data) {
                Ok(req) => Some(self.do_unlock(LockKind::Read, req).await),
                Err(_) => None,
            },
            "wunlock" => match serde_json::from_value::<UnlockReq>(data) {
                Ok(req) => Some(self.do_unlock(LockKind::Write, req).await),
                Err(_) => None,
            },
            _ => None,
        };
        if let Some(ok) = granted {
            if from.tag.is_some() {
                let _ = handler.reply(&from, &json!({ "ok": ok })).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemTable;
    use clique_gossip::GossipConfig;
    use clique_network::{KernelConfig, NetKernel};

    async fn manager(table: Option<Arc<dyn Table>>) -> LockManager {
        let kernel = NetKernel::new(
            Node::new("a", "127.0.0.1", 0),
            KernelConfig::new("127.0.0.1", 0),
        );
        kernel.start(None).await.unwrap();
        let gossip = Gossip::new(kernel, GossipConfig::default(), None);
        gossip.start("r").await.unwrap();
        let dlm = LockManager::new(gossip, LockConfig::default(), table);
        dlm.start("locks").await.unwrap();
        dlm
    }

    fn req(id: &str, holder: &str, ttl: u64) -> LockReq {
        LockReq {
            id: id.to_string(),
            holder: holder.to_string(),
            timeout: ttl,
        }
    }

    fn unreq(id: &str, holder: &str) -> UnlockReq {
        UnlockReq {
            id: id.to_string(),
            holder: holder.to_string(),
        }
    }

    #[tokio::test]
    async fn read_locks_share_and_block_writes() {
        let dlm = manager(None).await;
        assert!(dlm.do_lock(LockKind::Read, req("k", "h1", 30_000)).await);
        assert!(dlm.do_lock(LockKind::Read, req("k", "h2", 30_000)).await);
        assert!(!dlm.do_lock(LockKind::Write, req("k", "h3", 30_000)).await);

        let (kind, holders) = dlm.inspect("k").await.unwrap();
        assert_eq!(kind, LockKind::Read);
        assert_eq!(holders, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn write_lock_excludes_everything() {
        let dlm = manager(None).await;
        assert!(dlm.do_lock(LockKind::Write, req("k", "h1", 30_000)).await);
        assert!(!dlm.do_lock(LockKind::Write, req("k", "h2", 30_000)).await);
        assert!(!dlm.do_lock(LockKind::Read, req("k", "h2", 30_000)).await);
    }

    #[tokio::test]
    async fn repeated_rlock_is_idempotent_and_unlock_removes_once() {
        let dlm = manager(None).await;
        assert!(dlm.do_lock(LockKind::Read, req("k", "h1", 30_000)).await);
        assert!(dlm.do_lock(LockKind::Read, req("k", "h1", 30_000)).await);
        let (_, holders) = dlm.inspect("k").await.unwrap();
        assert_eq!(holders.len(), 1);

        assert!(dlm.do_unlock(LockKind::Read, unreq("k", "h1")).await);
        assert!(!dlm.do_unlock(LockKind::Read, unreq("k", "h1")).await);
        assert!(dlm.inspect("k").await.is_none());
    }

    #[tokio::test]
    async fn wrong_kind_unlock_is_refused() {
        let dlm = manager(None).await;
        assert!(dlm.do_lock(LockKind::Read, req("k", "h1", 30_000)).await);
        assert!(!dlm.do_unlock(LockKind::Write, unreq("k", "h1")).await);
    }

    #[tokio::test]
    async fn wrong_holder_write_unlock_is_refused() {
        let dlm = manager(None).await;
        assert!(dlm.do_lock(LockKind::Write, req("k", "h1", 30_000)).await);
        assert!(!dlm.do_unlock(LockKind::Write, unreq("k", "h2")).await);
        assert!(dlm.do_unlock(LockKind::Write, unreq("k", "h1")).await);
    }

    #[tokio::test]
    async fn holder_expires_after_ttl() {
        let dlm = manager(None).await;
        assert!(dlm.do_lock(LockKind::Write, req("k", "h1", 50)).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dlm.inspect("k").await.is_none());
        assert!(dlm.do_lock(LockKind::Write, req("k", "h2", 30_000)).await);
    }

    #[tokio::test]
    async fn durable_grants_survive_rebuild() {
        let table: Arc<dyn Table> = Arc::new(MemTable::new());
        let dlm = manager(Some(table.clone())).await;
        assert!(dlm.do_lock(LockKind::Read, req("k", "h1", 30_000)).await);
        assert!(dlm.do_lock(LockKind::Write, req("w", "h2", 30_000)).await);

        // A second manager over the same table sees both locks.
        let restored = manager(Some(table)).await;
        let (kind, holders) = restored.inspect("k").await.unwrap();
        assert_eq!(kind, LockKind::Read);
        assert_eq!(holders, vec!["h1"]);
        let (kind, holders) = restored.inspect("w").await.unwrap();
        assert_eq!(kind, LockKind::Write);
        assert_eq!(holders, vec!["h2"]);
    }
}
