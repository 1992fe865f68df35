//! Kernel events and notifications.

use clique_core::Node;

/// Why an inbound frame was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipKind {
    /// HMAC verification failed
    InvalidChecksum,
    /// Reply arrived on a known tag but from an unexpected node
    InvalidReply,
}

impl std::fmt::Display for SkipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipKind::InvalidChecksum => write!(f, "InvalidChecksum"),
            SkipKind::InvalidReply => write!(f, "InvalidReply"),
        }
    }
}

/// Connectivity and filtering events broadcast by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// An outbound connection reached its peer
    Connect(Node),

    /// An outbound connection lost its peer
    Disconnect(Node),

    /// An inbound frame was dropped
    Skip {
        /// Why the frame was dropped
        kind: SkipKind,
        /// Claimed sender of the dropped frame
        from: Node,
    },
}

impl KernelEvent {
    /// Creates a skip event.
    pub fn skip(kind: SkipKind, from: Node) -> Self {
        Self::Skip { kind, from }
    }
}
