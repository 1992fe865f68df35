//! Distributed semaphore manager.
//!
//! Unlike the lock manager, every semaphore has a single owner node, the one
//! the ring assigns to its id. All operations for a given semaphore route to
//! that owner, which keeps the holder set and its per-holder expiry timers.

use crate::config::SemaphoreConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::table::{Table, TableValue};
use async_trait::async_trait;
use clique_core::{monotonic_us, Node};
use clique_gossip::Gossip;
use clique_network::{
    decode_job_value, EventHandler, Handler, HandlerConfig, Job, NetworkError, NetworkResult,
    Origin, Target,
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

/// A semaphore's size and current occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreInfo {
    /// Configured capacity.
    pub n: u32,
    /// Holders currently active.
    pub active: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateReq {
    id: String,
    n: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdReq {
    id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PostReq {
    id: String,
    holder: String,
    /// TTL in milliseconds.
    timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CloseReq {
    id: String,
    holder: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SemResp {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active: Option<u32>,
}

struct SemEntry {
    size: u32,
    holders: HashMap<String, JoinHandle<()>>,
}

struct SemInner {
    config: SemaphoreConfig,
    gossip: Gossip,
    handler: StdRwLock<Option<Handler>>,
    semaphores: Mutex<HashMap<String, SemEntry>>,
    table: Option<Arc<dyn Table>>,
}

/// Handle to a node's semaphore manager. Cheap to clone.
#[derive(Clone)]
pub struct SemaphoreManager {
    inner: Arc<SemInner>,
}

fn holders_key(id: &str) -> String {
    format!("{id}::holders")
}

impl SemaphoreManager {
    /// Creates a semaphore manager over `gossip`. A `Some` table mirrors
    /// owner-side state so it survives a restart.
    pub fn new(gossip: Gossip, config: SemaphoreConfig, table: Option<Arc<dyn Table>>) -> Self {
        Self {
            inner: Arc::new(SemInner {
                config,
                gossip,
                handler: StdRwLock::new(None),
                semaphores: Mutex::new(HashMap::new()),
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
        let mut semaphores = self.inner.semaphores.lock().await;
        for (_, entry) in semaphores.drain() {
            for (_, timer) in entry.holders {
                timer.abort();
            }
        }
    }

    async fn owner(&self, id: &str) -> CoordinationResult<Node> {
        self.inner
            .gossip
            .range(id, 1)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| CoordinationError::NoReplicas { id: id.to_string() })
    }

    async fn call_owner(&self, id: &str, event: &str, data: &Value) -> CoordinationResult<SemResp> {
        let handler = self.handler()?;
        let owner = self.owner(id).await?;
        let bytes = handler
            .call(
                Target::Remote {
                    node: owner,
                    id: handler.id(),
                },
                event,
                data,
                Some(self.inner.config.request_timeout),
            )
            .await?;
        serde_json::from_slice::<SemResp>(&bytes).map_err(CoordinationError::bad_response)
    }

    /// Creates semaphore `id` with capacity `n`. Repeating the create with
    /// the same `n` is idempotent; a different `n` is a conflict.
    pub async fn create(&self, id: &str, n: u32) -> CoordinationResult<()> {
        let resp = self
            .call_owner(id, "create", &json!({ "id": id, "n": n }))
            .await?;
        if resp.ok {
            return Ok(());
        }
        match resp.error.as_deref() {
            Some("size_conflict") => Err(CoordinationError::SemaphoreSizeConflict {
                id: id.to_string(),
                existing: resp.existing.unwrap_or(0),
                requested: n,
            }),
            other => Err(CoordinationError::BadResponse {
                reason: format!("create failed: {other:?}"),
            }),
        }
    }

    /// Reads capacity and occupancy of semaphore `id`.
    pub async fn read(&self, id: &str) -> CoordinationResult<SemaphoreInfo> {
        let resp = self.call_owner(id, "read", &json!({ "id": id })).await?;
        if !resp.ok {
            return Err(CoordinationError::SemaphoreMissing { id: id.to_string() });
        }
        Ok(SemaphoreInfo {
            n: resp.n.unwrap_or(0),
            active: resp.active.unwrap_or(0),
        })
    }

    /// Destroys semaphore `id`, cancelling every holder timer.
    pub async fn destroy(&self, id: &str) -> CoordinationResult<()> {
        self.call_owner(id, "destroy", &json!({ "id": id })).await?;
        Ok(())
    }

    /// Takes a slot on semaphore `id` for `holder`, expiring after `ttl_ms`.
    /// Retries full responses with random back-off; `retries` of `None`
    /// retries forever, `Some(0)` fails on the first full response.
    pub async fn post(
        &self,
        id: &str,
        holder: &str,
        ttl_ms: u64,
        mut retries: Option<u32>,
    ) -> CoordinationResult<()> {
        let req = json!({ "id": id, "holder": holder, "timeout": ttl_ms });
        loop {
            let t0 = monotonic_us();
            let resp = self.call_owner(id, "post", &req).await?;
            let delta_ms = monotonic_us().saturating_sub(t0) / 1000;

            if let Some("missing") = resp.error.as_deref() {
                return Err(CoordinationError::SemaphoreMissing { id: id.to_string() });
            }
            if resp.ok && delta_ms < ttl_ms {
                return Ok(());
            }
            if resp.ok {
                // Granted, but the TTL already drained in transit.
                self.close_async(id, holder).await;
            }

            if let Some(n) = retries.as_mut() {
                if *n == 0 {
                    return Err(CoordinationError::SemaphoreFull { id: id.to_string() });
                }
                *n -= 1;
            }
            let delay = self.backoff_delay();
            tokio::time::sleep(delay).await;
        }
    }

    /// Releases `holder`'s slot. Returns false when the holder was absent.
    pub async fn close(&self, id: &str, holder: &str) -> CoordinationResult<bool> {
        let resp = self
            .call_owner(id, "close", &json!({ "id": id, "holder": holder }))
            .await?;
        Ok(resp.ok)
    }

    /// Fire-and-forget release.
    pub async fn close_async(&self, id: &str, holder: &str) {
        let Ok(handler) = self.handler() else {
            return;
        };
        let Ok(owner) = self.owner(id).await else {
            return;
        };
        let result = handler
            .cast(
                Target::Remote {
                    node: owner,
                    id: handler.id(),
                },
                "close",
                &json!({ "id": id, "holder": holder }),
            )
            .await;
        if let Err(e) = result {
            debug!(id, holder, "async close failed: {e}");
        }
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
        let removed = {
            let mut semaphores = self.inner.semaphores.lock().await;
            match semaphores.get_mut(id) {
                Some(entry) => entry.holders.remove(holder).is_some(),
                None => false,
            }
        };
        if removed {
            debug!(id, holder, "semaphore holder expired");
            self.mirror_holder_del(id, holder).await;
        }
    }

    async fn mirror_size(&self, id: &str, n: u32) {
        if let Some(table) = &self.inner.table {
            if let Err(e) = table.set(id, json!(n)).await {
                warn!(id, "could not mirror semaphore size: {e}");
            }
        }
    }

    async fn mirror_holder(&self, id: &str, holder: &str, expiry_us: u64) {
        if let Some(table) = &self.inner.table {
            if let Err(e) = table.hset(&holders_key(id), holder, json!(expiry_us)).await {
                warn!(id, "could not mirror semaphore holder: {e}");
            }
        }
    }

    async fn mirror_holder_del(&self, id: &str, holder: &str) {
        if let Some(table) = &self.inner.table {
            if let Err(e) = table.hdel(&holders_key(id), holder).await {
                warn!(id, "could not mirror semaphore release: {e}");
            }
        }
    }

    async fn mirror_destroy(&self, id: &str) {
        if let Some(table) = &self.inner.table {
            let _ = table.del(id).await;
            let _ = table.del(&holders_key(id)).await;
        }
    }

    async fn rebuild_from_table(&self) -> CoordinationResult<()> {
        let Some(table) = &self.inner.table else {
            return Ok(());
        };
        table.load().await?;

        let mut sizes: Vec<(String, u32)> = Vec::new();
        let mut holder_sets: Vec<(String, Vec<(String, u64)>)> = Vec::new();
        table
            .for_each(&mut |key, value| match value {
                TableValue::Scalar(v) => {
                    if let Some(n) = v.as_u64() {
                        sizes.push((key.to_string(), n as u32));
                    }
                }
                TableValue::Hash(hash) => {
                    if let Some(id) = key.strip_suffix("::holders") {
                        let holders = hash
                            .iter()
                            .map(|(h, v)| (h.clone(), v.as_u64().unwrap_or(0)))
                            .collect();
                        holder_sets.push((id.to_string(), holders));
                    }
                }
                TableValue::Set(_) => {}
            })
            .await?;

        let now = monotonic_us();
        {
            let mut semaphores = self.inner.semaphores.lock().await;
            for (id, size) in sizes {
                semaphores.insert(
                    id,
                    SemEntry {
                        size,
                        holders: HashMap::new(),
                    },
                );
            }
        }
        for (id, holders) in holder_sets {
            for (holder, expiry_us) in holders {
                if expiry_us <= now {
                    self.mirror_holder_del(&id, &holder).await;
                    continue;
                }
                let remaining_ms = ((expiry_us - now) / 1000).max(1);
                let timer = self.spawn_expiry(id.clone(), holder.clone(), remaining_ms);
                let mut semaphores = self.inner.semaphores.lock().await;
                if let Some(entry) = semaphores.get_mut(&id) {
                    entry.holders.insert(holder, timer);
                } else {
                    timer.abort();
                }
            }
        }
        Ok(())
    }

    async fn do_create(&self, req: CreateReq) -> SemResp {
        let mut semaphores = self.inner.semaphores.lock().await;
        match semaphores.get(&req.id) {
            Some(entry) if entry.size == req.n => SemResp {
                ok: true,
                ..Default::default()
            },
            Some(entry) => SemResp {
                ok: false,
                error: Some("size_conflict".to_string()),
                existing: Some(entry.size),
                ..Default::default()
            },
            None => {
                semaphores.insert(
                    req.id.clone(),
                    SemEntry {
                        size: req.n,
                        holders: HashMap::new(),
                    },
                );
                drop(semaphores);
                self.mirror_size(&req.id, req.n).await;
                SemResp {
                    ok: true,
                    ..Default::default()
                }
            }
        }
    }

    async fn do_read(&self, req: IdReq) -> SemResp {
        let semaphores = self.inner.semaphores.lock().await;
        match semaphores.get(&req.id) {
            Some(entry) => SemResp {
                ok: true,
                n: Some(entry.size),
                active: Some(entry.holders.len() as u32),
                ..Default::default()
            },
            None => SemResp {
                ok: false,
                error: Some("missing".to_string()),
                ..Default::default()
            },
        }
    }

    async fn do_destroy(&self, req: IdReq) -> SemResp {
        let removed = {
            let mut semaphores = self.inner.semaphores.lock().await;
            semaphores.remove(&req.id)
        };
        if let Some(entry) = removed {
            for (_, timer) in entry.holders {
                timer.abort();
            }
            self.mirror_destroy(&req.id).await;
        }
        SemResp {
            ok: true,
            ..Default::default()
        }
    }

    async fn do_post(&self, req: PostReq) -> SemResp {
        let expiry_us = monotonic_us() + req.timeout * 1000;
        let outcome = {
            let mut semaphores = self.inner.semaphores.lock().await;
            match semaphores.get_mut(&req.id) {
                None => None,
                Some(entry) => {
                    if entry.holders.contains_key(&req.holder) {
                        Some(true)
                    } else if entry.holders.len() as u32 >= entry.size {
                        Some(false)
                    } else {
                        let timer = self.spawn_expiry(
                            req.id.clone(),
                            req.holder.clone(),
                            req.timeout,
                        );
                        entry.holders.insert(req.holder.clone(), timer);
                        Some(true)
                    }
                }
            }
        };
        match outcome {
            None => SemResp {
                ok: false,
                error: Some("missing".to_string()),
                ..Default::default()
            },
            Some(true) => {
                self.mirror_holder(&req.id, &req.holder, expiry_us).await;
                SemResp {
                    ok: true,
                    ..Default::default()
                }
            }
            Some(false) => SemResp {
                ok: false,
                ..Default::default()
            },
        }
    }

    async fn do_close(&self, req: CloseReq) -> SemResp {
        let removed = {
            let mut semaphores = self.inner.semaphores.lock().await;
            match semaphores.get_mut(&req.id) {
                Some(entry) => match entry.holders.remove(&req.holder) {
                    Some(timer) => {
                        timer.abort();
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if removed {
            self.mirror_holder_del(&req.id, &req.holder).await;
        }
        SemResp {
            ok: removed,
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventHandler for SemaphoreManager {
    fn decode_parsed(&self, value: Value) -> NetworkResult<Job> {
        let job = decode_job_value(value)?;
        match job.event.as_str() {
            "create" => {
                serde_json::from_value::<CreateReq>(job.data.clone())
                    .map_err(NetworkError::invalid_job)?;
            }
            "read" | "destroy" => {
                serde_json::from_value::<IdReq>(job.data.clone())
                    .map_err(NetworkError::invalid_job)?;
            }
            "post" => {
                serde_json::from_value::<PostReq>(job.data.clone())
                    .map_err(NetworkError::invalid_job)?;
            }
            "close" => {
                serde_json::from_value::<CloseReq>(job.data.clone())
                    .map_err(NetworkError::invalid_job)?;
            }
            other => {
                return Err(NetworkError::invalid_job(format!(
                    "unknown semaphore event {other}"
                )));
            }
        }
        Ok(job)
    }

    async fn handle(&self, handler: Handler, event: String, data: Value, from: Origin) {
        let resp = match event.as_str() {
            "create" => match serde_json::from_value::<CreateReq>(data) {
                Ok(req) => Some(self.do_create(req).await),
                Err(_) => None,
            },
            "read" => match serde_json::from_value::<IdReq>(data) {
                Ok(req) => Some(self.do_read(req).await),
                Err(_) => None,
            },
            "destroy" => match serde_json::from_value::<IdReq>(data) {
                Ok(req) => Some(self.do_destroy(req).await),
                Err(_) => None,
            },
            "post" => match serde_json::from_value::<PostReq>(data) {
                Ok(req) => Some(self.do_post(req).await),
                Err(_) => None,
            },
            "close" => match serde_json::from_value::<CloseReq>(data) {
                Ok(req) => Some(self.do_close(req).await),
                Err(_) => None,
            },
            _ => None,
        };
        let Some(resp) = resp else {
            return;
        };
        if from.tag.is_some() {
            if let Ok(value) = serde_json::to_value(&resp) {
                let _ = handler.reply(&from, &value).await;
            }
        }
    }
}
