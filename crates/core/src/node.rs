//! Node identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cluster member: `(id, host, port)`.
///
/// Equality is componentwise. A `Node` is created by configuration or
/// deserialization and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    id: String,
    host: String,
    port: u16,
}

impl Node {
    /// Creates a new node identity.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// The node's cluster-unique name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hostname or address peers dial to reach this node.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port the node listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` dial string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_componentwise() {
        let a = Node::new("a", "localhost", 8000);
        let b = Node::new("a", "localhost", 8000);
        let c = Node::new("a", "localhost", 8001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn json_round_trip() {
        let node = Node::new("a", "localhost", 8000);
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, r#"{"id":"a","host":"localhost","port":8000}"#);
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(node, back);
    }
}
