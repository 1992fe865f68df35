//! Handler runtime.
//!
//! A `Handler` registers with the kernel under a string id, reassembles
//! inbound chunked streams into `{event, data}` jobs, and dispatches them to
//! an [`EventHandler`] implementation. It also wraps the kernel's call/cast
//! primitives so services speak in JSON events rather than raw byte streams.

use crate::config::HandlerConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::kernel::{InboundFrame, NetKernel, Origin};
use async_trait::async_trait;
use clique_core::Node;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// A decoded inbound message: the event name plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Application-defined event name.
    pub event: String,
    /// Event payload.
    pub data: Value,
}

/// Where a handler-level send is aimed.
#[derive(Debug, Clone)]
pub enum Target {
    /// A handler id on this node.
    Local(String),
    /// A handler id on a remote node.
    Remote { node: Node, id: String },
}

/// User-defined event callbacks for a [`Handler`].
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Decodes a reassembled buffer into a job. The default JSON-parses and
    /// hands off to [`decode_parsed`](Self::decode_parsed).
    fn decode_job(&self, buf: &[u8]) -> NetworkResult<Job> {
        let value: Value = serde_json::from_slice(buf).map_err(NetworkError::invalid_job)?;
        self.decode_parsed(value)
    }

    /// Decodes an already-parsed value into a job. Services override this to
    /// validate `data` per event.
    fn decode_parsed(&self, value: Value) -> NetworkResult<Job> {
        decode_job_value(value)
    }

    /// Handles one decoded event.
    async fn handle(&self, handler: Handler, event: String, data: Value, from: Origin);

    /// Called when the owning handler stops.
    async fn on_stop(&self) {}
}

/// Default `{event, data}` object decoding.
pub fn decode_job_value(value: Value) -> NetworkResult<Job> {
    let Value::Object(mut map) = value else {
        return Err(NetworkError::invalid_job("payload is not an object"));
    };
    let event = match map.remove("event") {
        Some(Value::String(event)) => event,
        _ => return Err(NetworkError::invalid_job("missing event name")),
    };
    let data = map.remove("data").unwrap_or(Value::Null);
    Ok(Job { event, data })
}

struct StreamAcc {
    buf: Vec<u8>,
    timer: JoinHandle<()>,
}

struct HandlerInner {
    kernel: NetKernel,
    config: HandlerConfig,
    delegate: Arc<dyn EventHandler>,
    id: StdRwLock<String>,
    mailbox_tx: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    streams: Mutex<HashMap<String, StreamAcc>>,
    task: Mutex<Option<JoinHandle<()>>>,
    idle_tx: watch::Sender<bool>,
}

/// Handle to a registered handler. Cheap to clone.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    /// Creates a handler over `kernel` dispatching to `delegate`. The id is
    /// a fresh uuid until [`start`](Self::start) names it.
    pub fn new(kernel: NetKernel, config: HandlerConfig, delegate: Arc<dyn EventHandler>) -> Self {
        let (idle_tx, _) = watch::channel(true);
        Self {
            inner: Arc::new(HandlerInner {
                kernel,
                config,
                delegate,
                id: StdRwLock::new(Uuid::new_v4().to_string()),
                mailbox_tx: Mutex::new(None),
                streams: Mutex::new(HashMap::new()),
                task: Mutex::new(None),
                idle_tx,
            }),
        }
    }

    /// The current handler id.
    pub fn id(&self) -> String {
        self.inner
            .id
            .read()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    /// The kernel this handler is registered with.
    pub fn kernel(&self) -> &NetKernel {
        &self.inner.kernel
    }

    /// Whether no streams are being reassembled.
    pub fn idle(&self) -> bool {
        self.inner
            .streams
            .lock()
            .map(|streams| streams.is_empty())
            .unwrap_or(true)
    }

    /// Resolves once the stream-accumulator map is empty.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        if self.idle() {
            return;
        }
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Registers with the kernel, optionally under an explicit `name`.
    /// Fails when the kernel already has a listener at that id.
    pub fn start(&self, name: Option<&str>) -> NetworkResult<()> {
        if let Some(name) = name {
            if let Ok(mut id) = self.inner.id.write() {
                *id = name.to_string();
            }
        }
        let id = self.id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.kernel.register_handler(&id, tx.clone())?;
        if let Ok(mut slot) = self.inner.mailbox_tx.lock() {
            *slot = Some(tx);
        }
        let runner = self.clone();
        let task = tokio::spawn(runner.run(rx));
        if let Ok(mut slot) = self.inner.task.lock() {
            *slot = Some(task);
        }
        debug!(id, "handler started");
        Ok(())
    }

    /// Unregisters and tears down. Without `force`, waits for in-flight
    /// streams to finish first. A fresh id is generated for restarts.
    pub async fn stop(&self, force: bool) {
        if !force {
            self.wait_idle().await;
        }
        let id = self.id();
        self.inner.kernel.unregister_handler(&id);
        if let Ok(mut slot) = self.inner.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        if let Ok(mut slot) = self.inner.mailbox_tx.lock() {
            *slot = None;
        }
        if let Ok(mut streams) = self.inner.streams.lock() {
            for (_, acc) in streams.drain() {
                acc.timer.abort();
            }
        }
        let _ = self.inner.idle_tx.send(true);
        self.inner.delegate.on_stop().await;
        if let Ok(mut slot) = self.inner.id.write() {
            *slot = Uuid::new_v4().to_string();
        }
        debug!(id, "handler stopped");
    }

    /// Detaches the kernel listener without changing id or dropping state.
    pub fn pause(&self) {
        self.inner.kernel.unregister_handler(&self.id());
    }

    /// Reattaches the kernel listener after [`pause`](Self::pause).
    pub fn resume(&self) -> NetworkResult<()> {
        let tx = self
            .inner
            .mailbox_tx
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        match tx {
            Some(tx) => self.inner.kernel.register_handler(&self.id(), tx),
            None => Err(NetworkError::Codec {
                reason: "handler was never started".to_string(),
            }),
        }
    }

    fn encode_payload(event: &str, data: &Value) -> NetworkResult<Vec<u8>> {
        serde_json::to_vec(&json!({ "event": event, "data": data })).map_err(NetworkError::codec)
    }

    /// Synchronous request to `target`, returning the raw reply bytes.
    pub async fn call(
        &self,
        target: Target,
        event: &str,
        data: &Value,
        timeout: Option<Duration>,
    ) -> NetworkResult<Vec<u8>> {
        let payload = Self::encode_payload(event, data)?;
        let (node, id) = match target {
            Target::Local(id) => (self.inner.kernel.node(), id),
            Target::Remote { node, id } => (node, id),
        };
        self.inner.kernel.call(&node, &id, &payload, timeout).await
    }

    /// One-way send to `target`.
    pub async fn cast(&self, target: Target, event: &str, data: &Value) -> NetworkResult<()> {
        let payload = Self::encode_payload(event, data)?;
        let (node, id) = match target {
            Target::Local(id) => (self.inner.kernel.node(), id),
            Target::Remote { node, id } => (node, id),
        };
        self.inner.kernel.cast(&node, &id, &payload).await
    }

    /// Calls the same-named handler on each node.
    pub async fn multicall(
        &self,
        nodes: &[Node],
        event: &str,
        data: &Value,
        timeout: Option<Duration>,
    ) -> Vec<NetworkResult<Vec<u8>>> {
        match Self::encode_payload(event, data) {
            Ok(payload) => {
                self.inner
                    .kernel
                    .multicall(nodes, &self.id(), &payload, timeout)
                    .await
            }
            Err(e) => nodes.iter().map(|_| Err(e.clone())).collect(),
        }
    }

    /// Casts to the same-named handler on each node.
    pub async fn abcast(&self, nodes: &[Node], event: &str, data: &Value) -> NetworkResult<()> {
        let payload = Self::encode_payload(event, data)?;
        self.inner.kernel.abcast(nodes, &self.id(), &payload).await;
        Ok(())
    }

    /// Replies to a handled request with a JSON value.
    pub async fn reply(&self, origin: &Origin, data: &Value) -> NetworkResult<()> {
        let bytes = serde_json::to_vec(data).map_err(NetworkError::codec)?;
        self.inner.kernel.reply(origin, &bytes).await
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<InboundFrame>) {
        while let Some(inbound) = rx.recv().await {
            self.on_frame(inbound).await;
        }
    }

    async fn on_frame(&self, inbound: InboundFrame) {
        let stream_id = inbound.stream.stream.clone();

        if inbound.stream.error.is_some() {
            // The sender aborted; drop the partial stream without dispatch.
            if let Ok(mut streams) = self.inner.streams.lock() {
                if let Some(acc) = streams.remove(&stream_id) {
                    acc.timer.abort();
                }
            }
            self.update_idle();
            return;
        }

        if let Ok(mut streams) = self.inner.streams.lock() {
            let acc = streams.entry(stream_id.clone()).or_insert_with(|| {
                let timer = self.spawn_stream_timer(
                    stream_id.clone(),
                    Origin {
                        node: inbound.from.clone(),
                        tag: inbound.tag.clone(),
                    },
                );
                StreamAcc {
                    buf: Vec::new(),
                    timer,
                }
            });
            if let Some(data) = &inbound.data {
                acc.buf.extend_from_slice(data);
            }
        }
        self.update_idle();

        if !inbound.stream.done {
            return;
        }

        let buf = {
            let Ok(mut streams) = self.inner.streams.lock() else {
                return;
            };
            match streams.remove(&stream_id) {
                Some(acc) => {
                    acc.timer.abort();
                    acc.buf
                }
                None => return,
            }
        };
        self.update_idle();

        match self.inner.delegate.decode_job(&buf) {
            Ok(job) => {
                let origin = Origin {
                    node: inbound.from,
                    tag: inbound.tag,
                };
                self.inner
                    .delegate
                    .handle(self.clone(), job.event, job.data, origin)
                    .await;
            }
            Err(e) => {
                // Decode failures drop the event with no reply.
                debug!(id = %self.id(), "dropping undecodable job: {e}");
            }
        }
    }

    fn spawn_stream_timer(&self, stream_id: String, origin: Origin) -> JoinHandle<()> {
        let handler = self.clone();
        let deadline = self.inner.config.stream_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let expired = handler
                .inner
                .streams
                .lock()
                .map(|mut streams| streams.remove(&stream_id).is_some())
                .unwrap_or(false);
            if !expired {
                return;
            }
            handler.update_idle();
            warn!(id = %handler.id(), stream = %stream_id, "stream assembly timed out");
            if origin.tag.is_some() {
                if let Err(e) = handler
                    .inner
                    .kernel
                    .reply_error(&origin, "stream assembly timed out")
                    .await
                {
                    debug!("could not send timeout reply: {e}");
                }
            }
        })
    }

    fn update_idle(&self) {
        let _ = self.inner.idle_tx.send(self.idle());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    struct Echo;

    #[async_trait]
    impl EventHandler for Echo {
        async fn handle(&self, handler: Handler, event: String, data: Value, from: Origin) {
            if event == "ping" {
                let _ = handler.reply(&from, &json!("pong")).await;
            } else {
                let _ = handler.reply(&from, &data).await;
            }
        }
    }

    async fn local_handler(name: &str) -> Handler {
        let kernel = NetKernel::new(
            Node::new("a", "127.0.0.1", 0),
            KernelConfig::new("127.0.0.1", 0),
        );
        kernel.start(None).await.unwrap();
        let handler = Handler::new(kernel, HandlerConfig::default(), Arc::new(Echo));
        handler.start(Some(name)).unwrap();
        handler
    }

    #[tokio::test]
    async fn local_ping_round_trip() {
        let handler = local_handler("p").await;
        let reply = handler
            .call(
                Target::Local("p".to_string()),
                "ping",
                &Value::Null,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(reply, b"\"pong\"");
    }

    #[tokio::test]
    async fn echo_preserves_payload() {
        let handler = local_handler("e").await;
        let reply = handler
            .call(
                Target::Local("e".to_string()),
                "echo",
                &json!({"value": 7}),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value, json!({"value": 7}));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let handler = local_handler("dup").await;
        let other = Handler::new(
            handler.kernel().clone(),
            HandlerConfig::default(),
            Arc::new(Echo),
        );
        assert!(matches!(
            other.start(Some("dup")),
            Err(NetworkError::HandlerExists { .. })
        ));
    }

    #[tokio::test]
    async fn stop_regenerates_id() {
        let handler = local_handler("gone").await;
        handler.stop(true).await;
        assert_ne!(handler.id(), "gone");
        let again = local_handler("gone").await;
        drop(again);
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(decode_job_value(json!([1, 2])).is_err());
        assert!(decode_job_value(json!({"data": 1})).is_err());
        let job = decode_job_value(json!({"event": "x", "data": 1})).unwrap();
        assert_eq!(job.event, "x");
        assert_eq!(job.data, json!(1));
    }
}
