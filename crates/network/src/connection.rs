//! Per-peer outbound connections.
//!
//! Each peer the kernel knows gets one `Connection`: a task owning the
//! outbound socket, a queue of frames to flush while the socket is down, and
//! the set of streams currently in flight. The task reconnects on failure up
//! to the configured retry cap; a graceful stop waits for the connection to
//! go idle (empty queue, no open streams) before closing.

use crate::error::{NetworkError, NetworkResult};
use crate::events::KernelEvent;
use crate::frame::{write_frame, Frame};
use clique_core::Node;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started
    Inactive,
    /// First dial in progress; sends enqueue
    Connecting,
    /// Socket up; sends flush immediately
    Open,
    /// Socket lost while active; sends enqueue
    Reconnecting,
    /// Graceful stop requested; closing once idle
    Closing,
    /// Stopped
    Closed,
}

impl ConnectionState {
    /// Whether the connection can still accept sends.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Inactive => "Inactive",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Open",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
        };
        write!(f, "{name}")
    }
}

enum ConnCmd {
    Send(Frame),
    Stop { force: bool, done: oneshot::Sender<()> },
}

/// Handle to a per-peer connection task.
#[derive(Debug, Clone)]
pub struct Connection {
    target: Node,
    cmd_tx: mpsc::UnboundedSender<ConnCmd>,
    idle_rx: watch::Receiver<bool>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Connection {
    /// Spawns the connection task for `target`.
    pub(crate) fn start(
        target: Node,
        retry: Duration,
        max_retries: u32,
        events: broadcast::Sender<KernelEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (idle_tx, idle_rx) = watch::channel(true);
        let state = Arc::new(Mutex::new(ConnectionState::Inactive));

        let task = ConnTask {
            target: target.clone(),
            retry,
            max_retries,
            cmd_rx,
            idle_tx,
            state: state.clone(),
            events,
            queue: VecDeque::new(),
            streams: HashSet::new(),
            closing: false,
            pending_stop: None,
        };
        tokio::spawn(task.run());

        Self {
            target,
            cmd_tx,
            idle_rx,
            state,
        }
    }

    /// The peer this connection dials.
    pub fn target(&self) -> &Node {
        &self.target
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Closed)
    }

    /// Whether the outbound queue and the in-flight stream set are empty.
    pub fn idle(&self) -> bool {
        *self.idle_rx.borrow()
    }

    /// Resolves once the connection is idle.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle_rx.clone();
        // Closed watch means the task is gone, which is as idle as it gets.
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Hands a frame to the connection. Queued while the socket is down.
    pub fn send(&self, frame: Frame) -> NetworkResult<()> {
        self.cmd_tx
            .send(ConnCmd::Send(frame))
            .map_err(|_| NetworkError::Disconnected {
                node: self.target.clone(),
            })
    }

    /// Stops the connection: immediately when `force`, otherwise once idle.
    pub async fn stop(&self, force: bool) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ConnCmd::Stop {
                force,
                done: done_tx,
            })
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }
}

struct ConnTask {
    target: Node,
    retry: Duration,
    max_retries: u32,
    cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    idle_tx: watch::Sender<bool>,
    state: Arc<Mutex<ConnectionState>>,
    events: broadcast::Sender<KernelEvent>,
    queue: VecDeque<Frame>,
    streams: HashSet<String>,
    closing: bool,
    pending_stop: Option<oneshot::Sender<()>>,
}

enum CmdOutcome {
    Continue,
    Finished,
}

impl ConnTask {
    async fn run(mut self) {
        let mut ever_connected = false;
        'lifecycle: loop {
            self.set_state(if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let socket = match self.dial().await {
                Some(socket) => socket,
                None => {
                    self.finish();
                    return;
                }
            };
            ever_connected = true;
            self.set_state(ConnectionState::Open);
            info!(peer = %self.target, "connection open");
            let _ = self.events.send(KernelEvent::Connect(self.target.clone()));

            let (mut read_half, mut write_half) = socket.into_split();

            // Flush whatever accumulated while the socket was down.
            while let Some(frame) = self.queue.pop_front() {
                if write_frame(&mut write_half, &frame).await.is_err() {
                    self.queue.push_front(frame);
                    self.lost();
                    continue 'lifecycle;
                }
            }
            self.update_idle();
            if self.closing && self.is_idle() {
                self.finish();
                return;
            }

            let mut probe = [0u8; 64];
            loop {
                tokio::select! {
                    cmd = self.cmd_rx.recv() => {
                        match cmd {
                            Some(ConnCmd::Send(frame)) => {
                                self.track(&frame);
                                if write_frame(&mut write_half, &frame).await.is_err() {
                                    self.queue.push_back(frame);
                                    self.lost();
                                    continue 'lifecycle;
                                }
                                self.update_idle();
                                if self.closing && self.is_idle() {
                                    self.finish();
                                    return;
                                }
                            }
                            Some(ConnCmd::Stop { force: true, done }) => {
                                self.queue.clear();
                                self.streams.clear();
                                self.update_idle();
                                self.set_state(ConnectionState::Closed);
                                let _ = done.send(());
                                return;
                            }
                            Some(ConnCmd::Stop { force: false, done }) => {
                                self.closing = true;
                                self.pending_stop = Some(done);
                                self.set_state(ConnectionState::Closing);
                                if self.is_idle() {
                                    self.finish();
                                    return;
                                }
                            }
                            None => {
                                self.set_state(ConnectionState::Closed);
                                return;
                            }
                        }
                    }
                    // The peer never writes on this socket; a read resolving
                    // means EOF or error, i.e. the peer went away.
                    result = read_half.read(&mut probe) => {
                        if matches!(result, Ok(0) | Err(_)) {
                            self.lost();
                            continue 'lifecycle;
                        }
                    }
                }
            }
        }
    }

    async fn dial(&mut self) -> Option<TcpStream> {
        let address = self.target.address();
        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    if matches!(self.handle_cmd_while_down(cmd), CmdOutcome::Finished) {
                        return None;
                    }
                }
                result = TcpStream::connect(&address) => {
                    match result {
                        Ok(socket) => return Some(socket),
                        Err(e) => {
                            attempts += 1;
                            debug!(peer = %self.target, attempts, "dial failed: {e}");
                            if attempts > self.max_retries {
                                warn!(peer = %self.target, "giving up after {attempts} dial attempts");
                                let _ = self.events.send(KernelEvent::Disconnect(self.target.clone()));
                                return None;
                            }
                            if !self.backoff().await {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sleeps for the retry interval while continuing to service commands.
    /// Returns false when a stop finished the task.
    async fn backoff(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.retry);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => {
                    if matches!(self.handle_cmd_while_down(cmd), CmdOutcome::Finished) {
                        return false;
                    }
                }
            }
        }
    }

    fn handle_cmd_while_down(&mut self, cmd: Option<ConnCmd>) -> CmdOutcome {
        match cmd {
            Some(ConnCmd::Send(frame)) => {
                self.track(&frame);
                self.queue.push_back(frame);
                self.update_idle();
                CmdOutcome::Continue
            }
            Some(ConnCmd::Stop { force: true, done }) => {
                self.queue.clear();
                self.streams.clear();
                self.update_idle();
                self.set_state(ConnectionState::Closed);
                let _ = done.send(());
                CmdOutcome::Finished
            }
            Some(ConnCmd::Stop { force: false, done }) => {
                self.closing = true;
                self.pending_stop = Some(done);
                self.set_state(ConnectionState::Closing);
                if self.is_idle() {
                    self.finish();
                    return CmdOutcome::Finished;
                }
                CmdOutcome::Continue
            }
            None => {
                self.set_state(ConnectionState::Closed);
                CmdOutcome::Finished
            }
        }
    }

    fn track(&mut self, frame: &Frame) {
        if frame.stream.done {
            self.streams.remove(&frame.stream.stream);
        } else {
            self.streams.insert(frame.stream.stream.clone());
        }
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.streams.is_empty()
    }

    fn update_idle(&self) {
        let _ = self.idle_tx.send_replace(self.is_idle());
    }

    fn lost(&mut self) {
        debug!(peer = %self.target, "connection lost");
        self.set_state(ConnectionState::Reconnecting);
        let _ = self.events.send(KernelEvent::Disconnect(self.target.clone()));
    }

    fn finish(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.update_idle();
        if let Some(done) = self.pending_stop.take() {
            let _ = done.send(());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EVENT_CHANNEL_SIZE;
    use tokio::net::TcpListener;

    fn node(port: u16) -> Node {
        Node::new("peer", "127.0.0.1", port)
    }

    fn frame(stream: &str, done: bool) -> Frame {
        if done {
            Frame::done("h", None, node(0), stream)
        } else {
            Frame::chunk("h", None, node(0), stream, vec![1])
        }
    }

    #[tokio::test]
    async fn queues_while_down_and_flushes_on_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let conn = Connection::start(node(port), Duration::from_millis(10), 5, events);
        conn.send(frame("s1", false)).unwrap();
        conn.send(frame("s1", true)).unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        let first = crate::frame::read_frame(&mut socket).await.unwrap().unwrap();
        assert_eq!(first.stream.stream, "s1");
        assert!(!first.stream.done);
        let last = crate::frame::read_frame(&mut socket).await.unwrap().unwrap();
        assert!(last.stream.done);

        conn.wait_idle().await;
        assert!(conn.idle());
        conn.stop(true).await;
    }

    #[tokio::test]
    async fn idle_tracks_open_streams() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let conn = Connection::start(node(port), Duration::from_millis(10), 5, events);
        let (_socket, _) = listener.accept().await.unwrap();

        conn.send(frame("s1", false)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.idle());

        conn.send(frame("s1", true)).unwrap();
        conn.wait_idle().await;
        assert!(conn.idle());
        conn.stop(true).await;
    }

    #[tokio::test]
    async fn graceful_stop_waits_for_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let conn = Connection::start(node(port), Duration::from_millis(10), 5, events);
        let (_socket, _) = listener.accept().await.unwrap();
        conn.send(frame("s1", false)).unwrap();

        let stopper = conn.clone();
        let handle = tokio::spawn(async move { stopper.stop(false).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        conn.send(frame("s1", true)).unwrap();
        handle.await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (events, mut rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        // Port 1 is reserved and refuses connections quickly.
        let conn = Connection::start(node(1), Duration::from_millis(5), 1, events);
        let event = rx.recv().await.unwrap();
        assert_eq!(event, KernelEvent::Disconnect(node(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
