//! The network kernel.
//!
//! The kernel owns every socket a node touches: outbound [`Connection`] sinks
//! to known peers and inbound source tasks for accepted sockets. It frames
//! and signs outbound messages, verifies and routes inbound ones, and
//! implements the tagged synchronous call / one-way cast protocol over
//! chunked streams.

use crate::config::{KernelConfig, EVENT_CHANNEL_SIZE, MAX_CHUNK_BYTES};
use crate::connection::Connection;
use crate::error::{NetworkError, NetworkResult};
use crate::events::{KernelEvent, SkipKind};
use crate::frame::{read_frame, Frame, StreamHeader};
use clique_core::Node;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a handler event came from: the sending node plus the tag to reply
/// on, when the sender expects a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Sending node.
    pub node: Node,
    /// Reply tag; `None` on casts.
    pub tag: Option<String>,
}

/// Raw inbound frame handed to a handler mailbox for reassembly.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Reply tag carried by the request, if any.
    pub tag: Option<String>,
    /// Sending node.
    pub from: Node,
    /// Stream membership and completion.
    pub stream: StreamHeader,
    /// Chunk bytes.
    pub data: Option<Vec<u8>>,
}

enum ReplyChunk {
    Data(Vec<u8>),
    Done,
    Failed(String),
}

struct ReplyListener {
    expected: Node,
    tx: mpsc::UnboundedSender<ReplyChunk>,
}

struct KernelInner {
    node: StdRwLock<Node>,
    config: KernelConfig,
    cookie: StdRwLock<Option<String>>,
    sinks: RwLock<HashMap<Node, Connection>>,
    sources: RwLock<HashMap<String, JoinHandle<()>>>,
    handlers: StdRwLock<HashMap<String, mpsc::UnboundedSender<InboundFrame>>>,
    tags: Mutex<HashMap<String, ReplyListener>>,
    events: broadcast::Sender<KernelEvent>,
    ready_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    listen_port: Mutex<Option<u16>>,
}

/// Handle to a node's network kernel. Cheap to clone.
#[derive(Clone)]
pub struct NetKernel {
    inner: Arc<KernelInner>,
}

impl NetKernel {
    /// Creates a kernel identified by `node`.
    pub fn new(node: Node, config: KernelConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (ready_tx, _) = watch::channel(false);
        let cookie = config.cookie.clone();
        Self {
            inner: Arc::new(KernelInner {
                node: StdRwLock::new(node),
                config,
                cookie: StdRwLock::new(cookie),
                sinks: RwLock::new(HashMap::new()),
                sources: RwLock::new(HashMap::new()),
                handlers: StdRwLock::new(HashMap::new()),
                tags: Mutex::new(HashMap::new()),
                events,
                ready_tx,
                listener: Mutex::new(None),
                listen_port: Mutex::new(None),
            }),
        }
    }

    /// The kernel's own identity. When configured with port zero, the
    /// identity carries the real bound port once the kernel has started.
    pub fn node(&self) -> Node {
        self.inner.node()
    }

    /// Subscribes to connectivity and skip events.
    pub fn events(&self) -> broadcast::Receiver<KernelEvent> {
        self.inner.events.subscribe()
    }

    /// Watch flag set once the listener is bound.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.inner.ready_tx.subscribe()
    }

    /// The port the listener actually bound, once started.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.listen_port.lock().ok().and_then(|p| *p)
    }

    /// Binds the listener and starts accepting inbound sockets. A `Some`
    /// cookie overrides the configured one for the kernel's lifetime.
    pub async fn start(&self, cookie: Option<String>) -> NetworkResult<u16> {
        if let Some(cookie) = cookie {
            if let Ok(mut slot) = self.inner.cookie.write() {
                *slot = Some(cookie);
            }
        }

        let address = format!("{}:{}", self.inner.config.host, self.inner.config.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| NetworkError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| NetworkError::Bind {
                address,
                reason: e.to_string(),
            })?
            .port();
        if let Ok(mut slot) = self.inner.listen_port.lock() {
            *slot = Some(port);
        }
        if self.inner.config.port == 0 {
            if let Ok(mut node) = self.inner.node.write() {
                *node = Node::new(node.id(), node.host(), port);
            }
        }

        let inner = self.inner.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(%peer, "accepted inbound socket");
                        let source_id = Uuid::new_v4().to_string();
                        let task = tokio::spawn(run_source(
                            inner.clone(),
                            source_id.clone(),
                            socket,
                        ));
                        inner.sources.write().await.insert(source_id, task);
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                }
            }
        });
        if let Ok(mut slot) = self.inner.listener.lock() {
            *slot = Some(accept);
        }

        let _ = self.inner.ready_tx.send(true);
        info!(node = %self.node(), port, "kernel listening");
        Ok(port)
    }

    /// Stops the listener, all sources, and all sinks.
    pub async fn stop(&self, force: bool) {
        info!(node = %self.node(), force, "kernel stopping");
        let _ = self.inner.ready_tx.send(false);

        if let Ok(mut slot) = self.inner.listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        let sources: Vec<JoinHandle<()>> = {
            let mut map = self.inner.sources.write().await;
            map.drain().map(|(_, task)| task).collect()
        };
        for task in sources {
            task.abort();
        }

        let sinks: Vec<Connection> = {
            let mut map = self.inner.sinks.write().await;
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in sinks {
            conn.stop(force).await;
        }

        if let Ok(mut tags) = self.inner.tags.lock() {
            tags.clear();
        }
    }

    /// Opens an outbound connection to `node`. No-op for self or for peers
    /// that already have a sink.
    pub async fn connect(&self, node: &Node) {
        if *node == self.node() {
            return;
        }
        let mut sinks = self.inner.sinks.write().await;
        if sinks.contains_key(node) {
            return;
        }
        debug!(peer = %node, "opening sink");
        let conn = Connection::start(
            node.clone(),
            self.inner.config.retry,
            self.inner.config.max_retries,
            self.inner.events.clone(),
        );
        sinks.insert(node.clone(), conn);
    }

    /// Stops and removes the sink for `node`.
    pub async fn disconnect(&self, node: &Node, force: bool) {
        let conn = self.inner.sinks.write().await.remove(node);
        if let Some(conn) = conn {
            debug!(peer = %node, force, "closing sink");
            conn.stop(force).await;
        }
    }

    /// The sink for `node`, if one exists.
    pub async fn sink(&self, node: &Node) -> Option<Connection> {
        self.inner.sinks.read().await.get(node).cloned()
    }

    /// Nodes that currently have sinks.
    pub async fn sinks(&self) -> Vec<Node> {
        self.inner.sinks.read().await.keys().cloned().collect()
    }

    /// Registers a handler mailbox under `id`.
    pub fn register_handler(
        &self,
        id: &str,
        tx: mpsc::UnboundedSender<InboundFrame>,
    ) -> NetworkResult<()> {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if handlers.contains_key(id) {
            return Err(NetworkError::HandlerExists { id: id.to_string() });
        }
        handlers.insert(id.to_string(), tx);
        Ok(())
    }

    /// Removes the handler mailbox under `id`.
    pub fn unregister_handler(&self, id: &str) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.remove(id);
    }

    /// Synchronous request: streams `data` to `event` on `node` and collects
    /// the tagged reply. `timeout` of `None` waits forever; a zero timeout
    /// fails immediately with [`NetworkError::Timeout`].
    pub async fn call(
        &self,
        node: &Node,
        event: &str,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> NetworkResult<Vec<u8>> {
        let stream_id = Uuid::new_v4().to_string();
        let tag = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Ok(mut tags) = self.inner.tags.lock() {
            tags.insert(
                tag.clone(),
                ReplyListener {
                    expected: node.clone(),
                    tx,
                },
            );
        }

        if let Err(e) = self
            .send_stream(node, event, Some(tag.clone()), &stream_id, data)
            .await
        {
            self.remove_tag(&tag);
            return Err(e);
        }

        if let Some(d) = timeout {
            if d.is_zero() {
                self.remove_tag(&tag);
                return Err(NetworkError::Timeout { timeout_ms: 0 });
            }
        }

        let peer = node.clone();
        let collect = async move {
            let mut buf = Vec::new();
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    ReplyChunk::Data(mut bytes) => buf.append(&mut bytes),
                    ReplyChunk::Done => return Ok(buf),
                    ReplyChunk::Failed(message) => return Err(NetworkError::Remote { message }),
                }
            }
            Err(NetworkError::Disconnected { node: peer })
        };

        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, collect).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout {
                    timeout_ms: d.as_millis() as u64,
                }),
            },
            None => collect.await,
        };
        self.remove_tag(&tag);
        result
    }

    /// Per-node [`call`](Self::call), gathered into a parallel result array.
    pub async fn multicall(
        &self,
        nodes: &[Node],
        event: &str,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Vec<NetworkResult<Vec<u8>>> {
        join_all(
            nodes
                .iter()
                .map(|node| self.call(node, event, data, timeout)),
        )
        .await
    }

    /// One-way send with no reply tracking.
    pub async fn cast(&self, node: &Node, event: &str, data: &[u8]) -> NetworkResult<()> {
        let stream_id = Uuid::new_v4().to_string();
        self.send_stream(node, event, None, &stream_id, data).await
    }

    /// Casts to each node, logging failures.
    pub async fn abcast(&self, nodes: &[Node], event: &str, data: &[u8]) {
        for node in nodes {
            if let Err(e) = self.cast(node, event, data).await {
                warn!(peer = %node, "abcast failed: {e}");
            }
        }
    }

    /// Replies to a handled request by casting on its tag.
    pub async fn reply(&self, origin: &Origin, data: &[u8]) -> NetworkResult<()> {
        let tag = origin.tag.as_ref().ok_or(NetworkError::NoTag)?;
        self.cast(&origin.node, tag, data).await
    }

    /// Fails a pending request: sends a single error-carrying final frame on
    /// the origin's tag.
    pub async fn reply_error(&self, origin: &Origin, message: &str) -> NetworkResult<()> {
        let tag = origin.tag.as_ref().ok_or(NetworkError::NoTag)?;
        let stream_id = Uuid::new_v4().to_string();
        let mut frame = Frame::failed(
            tag,
            None,
            self.node(),
            stream_id,
            crate::frame::ErrorPayload::new(message),
        );
        let cookie = self
            .inner
            .cookie
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(cookie) = cookie {
            frame.sign(&cookie)?;
        }
        if origin.node == self.node() {
            self.inner.route(frame);
            return Ok(());
        }
        let conn = self
            .sink(&origin.node)
            .await
            .ok_or_else(|| NetworkError::NoSink {
                node: origin.node.clone(),
            })?;
        conn.send(frame)
    }

    fn make_frames(
        &self,
        event: &str,
        tag: Option<String>,
        stream_id: &str,
        data: &[u8],
    ) -> NetworkResult<Vec<Frame>> {
        let mut frames = Vec::with_capacity(data.len() / MAX_CHUNK_BYTES + 2);
        for chunk in data.chunks(MAX_CHUNK_BYTES) {
            frames.push(Frame::chunk(
                event,
                tag.clone(),
                self.node(),
                stream_id,
                chunk.to_vec(),
            ));
        }
        frames.push(Frame::done(
            event,
            tag,
            self.node(),
            stream_id,
        ));

        let cookie = self
            .inner
            .cookie
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(cookie) = cookie {
            for frame in &mut frames {
                frame.sign(&cookie)?;
            }
        }
        Ok(frames)
    }

    async fn send_stream(
        &self,
        node: &Node,
        event: &str,
        tag: Option<String>,
        stream_id: &str,
        data: &[u8],
    ) -> NetworkResult<()> {
        let frames = self.make_frames(event, tag, stream_id, data)?;
        if *node == self.node() {
            for frame in frames {
                self.inner.route(frame);
            }
            return Ok(());
        }
        let conn = self
            .sink(node)
            .await
            .ok_or_else(|| NetworkError::NoSink { node: node.clone() })?;
        for frame in frames {
            conn.send(frame)?;
        }
        Ok(())
    }

    fn remove_tag(&self, tag: &str) {
        if let Ok(mut tags) = self.inner.tags.lock() {
            tags.remove(tag);
        }
    }
}

impl KernelInner {
    fn node(&self) -> Node {
        self.node
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Routes one verified frame: reply tags first, then handler mailboxes.
    fn route(&self, frame: Frame) {
        if let Ok(mut tags) = self.tags.lock() {
            if let Some(listener) = tags.get(&frame.id) {
                if listener.expected != frame.from {
                    warn!(
                        tag = %frame.id,
                        expected = %listener.expected,
                        actual = %frame.from,
                        "dropping reply from unexpected node"
                    );
                    let _ = self.events.send(KernelEvent::skip(
                        SkipKind::InvalidReply,
                        frame.from.clone(),
                    ));
                    return;
                }
                let finished = frame.stream.done;
                if let Some(error) = frame.stream.error {
                    let _ = listener.tx.send(ReplyChunk::Failed(error.message));
                } else {
                    if let Some(payload) = frame.data {
                        let _ = listener.tx.send(ReplyChunk::Data(payload.0));
                    }
                    if finished {
                        let _ = listener.tx.send(ReplyChunk::Done);
                    }
                }
                if finished {
                    tags.remove(&frame.id);
                }
                return;
            }
        }

        let handler = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            handlers.get(&frame.id).cloned()
        };
        match handler {
            Some(tx) => {
                let inbound = InboundFrame {
                    tag: frame.tag,
                    from: frame.from,
                    stream: frame.stream,
                    data: frame.data.map(|p| p.0),
                };
                let _ = tx.send(inbound);
            }
            None => {
                debug!(id = %frame.id, "no handler for inbound frame");
            }
        }
    }
}

async fn run_source(inner: Arc<KernelInner>, source_id: String, mut socket: tokio::net::TcpStream) {
    loop {
        match read_frame(&mut socket).await {
            Ok(Some(frame)) => {
                let cookie = inner.cookie.read().ok().and_then(|slot| slot.clone());
                if let Some(cookie) = cookie {
                    if !frame.verify(&cookie) {
                        warn!(from = %frame.from, "dropping frame with invalid checksum");
                        let _ = inner.events.send(KernelEvent::skip(
                            SkipKind::InvalidChecksum,
                            frame.from.clone(),
                        ));
                        continue;
                    }
                }
                inner.route(frame);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(source = %source_id, "source read failed: {e}");
                break;
            }
        }
    }
    inner.sources.write().await.remove(&source_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, port: u16) -> Node {
        Node::new(id, "127.0.0.1", port)
    }

    async fn started_kernel(id: &str) -> (NetKernel, Node) {
        let kernel = NetKernel::new(
            node(id, 0),
            KernelConfig::new("127.0.0.1", 0),
        );
        let port = kernel.start(None).await.unwrap();
        // The advertised identity must carry the real port so peers can dial.
        let identity = node(id, port);
        (kernel, identity)
    }

    #[tokio::test]
    async fn connect_to_self_is_a_no_op() {
        let kernel = NetKernel::new(node("a", 9000), KernelConfig::default());
        let me = node("a", 9000);
        kernel.connect(&me).await;
        assert!(kernel.sinks().await.is_empty());
    }

    #[tokio::test]
    async fn call_without_sink_fails() {
        let (kernel, _) = started_kernel("a").await;
        let absent = node("ghost", 1);
        let err = kernel
            .call(&absent, "h", b"x", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::NoSink { .. }));
    }

    #[tokio::test]
    async fn zero_timeout_fails_with_timeout() {
        let (kernel, identity) = started_kernel("a").await;
        // Local call so the frames are deliverable; the deadline still wins.
        let err = kernel
            .call(&identity, "nobody", b"x", Some(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { timeout_ms: 0 }));
    }

    #[tokio::test]
    async fn local_call_reaches_registered_handler() {
        let kernel = NetKernel::new(node("a", 0), KernelConfig::new("127.0.0.1", 0));
        kernel.start(None).await.unwrap();
        let me = kernel.node();

        let (tx, mut rx) = mpsc::unbounded_channel();
        kernel.register_handler("echo", tx).unwrap();

        let responder = kernel.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut origin = None;
            while let Some(inbound) = rx.recv().await {
                if let Some(mut data) = inbound.data {
                    buf.append(&mut data);
                }
                if inbound.stream.done {
                    origin = Some(Origin {
                        node: inbound.from,
                        tag: inbound.tag,
                    });
                    break;
                }
            }
            let origin = origin.unwrap();
            responder.reply(&origin, &buf).await.unwrap();
        });

        let reply = kernel
            .call(&me, "echo", b"ping", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn reply_without_tag_fails() {
        let kernel = NetKernel::new(node("a", 0), KernelConfig::new("127.0.0.1", 0));
        let origin = Origin {
            node: kernel.node(),
            tag: None,
        };
        assert!(matches!(
            kernel.reply(&origin, b"x").await,
            Err(NetworkError::NoTag)
        ));
    }
}
