//! Kernel configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default reconnect interval between dial attempts.
pub const RETRY_INTERVAL_MS: u64 = 1_000;
/// Default cap on consecutive failed dial attempts.
pub const MAX_RETRIES: u32 = 5;
/// Chunk size for streamed payloads.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;
/// Upper bound on a single wire frame.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// Default deadline for reassembling one inbound stream.
pub const STREAM_TIMEOUT_MS: u64 = 30_000;
/// Buffer size for kernel event broadcast channels.
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Network kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Hostname the kernel advertises and binds.
    pub host: String,

    /// TCP port to listen on. Zero asks the OS for an ephemeral port.
    pub port: u16,

    /// Shared secret for frame signing. `None` disables checksums.
    pub cookie: Option<String>,

    /// Interval between reconnect attempts.
    pub retry: Duration,

    /// Consecutive failed dials before a connection gives up.
    pub max_retries: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            cookie: None,
            retry: Duration::from_millis(RETRY_INTERVAL_MS),
            max_retries: MAX_RETRIES,
        }
    }
}

impl KernelConfig {
    /// Creates a configuration listening on `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets the shared signing secret.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    /// Sets the reconnect interval.
    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the reconnect attempt cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Handler runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Deadline for assembling a single inbound stream.
    pub stream_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_millis(STREAM_TIMEOUT_MS),
        }
    }
}

impl HandlerConfig {
    /// Sets the stream-assembly deadline.
    pub fn with_stream_timeout(mut self, stream_timeout: Duration) -> Self {
        self.stream_timeout = stream_timeout;
        self
    }
}
