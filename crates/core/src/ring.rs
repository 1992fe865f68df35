//! Consistent hash ring with virtual nodes.
//!
//! The ring is an ordered map from hashed virtual-node keys to node
//! identities. Each node appears `weight` times (default `rfactor`) under the
//! keys `base64(sha256("<id>_<i>"))` for `i` in `1..=weight`. Lookup walks
//! clockwise: a key maps to the first virtual position strictly greater than
//! its hash, wrapping to the smallest position past the end.

use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Mutex;

/// Bounded memo of pre-hash string to ring key. The cache is an optimization
/// only and never alters observable outputs.
const HASH_CACHE_SIZE: usize = 1024;

/// Serialized ring shape carried in gossip messages.
#[derive(Serialize, Deserialize)]
struct RingJson {
    rfactor: u32,
    pfactor: u32,
    tree: BTreeMap<String, Node>,
}

/// Consistent hash ring.
#[derive(Serialize, Deserialize)]
#[serde(from = "RingJson", into = "RingJson")]
pub struct HashRing {
    rfactor: u32,
    pfactor: u32,
    tree: BTreeMap<String, Node>,
    weights: HashMap<String, u32>,
    cache: Mutex<LruCache<String, String>>,
}

impl HashRing {
    /// Creates an empty ring with `rfactor` virtual copies per node and at
    /// most `pfactor` neighbors returned by [`next`](Self::next) and
    /// [`prev`](Self::prev).
    pub fn new(rfactor: u32, pfactor: u32) -> Self {
        Self {
            rfactor,
            pfactor,
            tree: BTreeMap::new(),
            weights: HashMap::new(),
            cache: Self::new_cache(),
        }
    }

    fn new_cache() -> Mutex<LruCache<String, String>> {
        let capacity = NonZeroUsize::new(HASH_CACHE_SIZE).expect("nonzero cache size");
        Mutex::new(LruCache::new(capacity))
    }

    /// Number of virtual copies per node.
    pub fn rfactor(&self) -> u32 {
        self.rfactor
    }

    /// Maximum neighbor count returned by `next`/`prev`.
    pub fn pfactor(&self) -> u32 {
        self.pfactor
    }

    /// Number of virtual entries.
    pub fn size(&self) -> usize {
        self.tree.len()
    }

    /// Number of distinct nodes.
    pub fn number_nodes(&self) -> usize {
        self.weights.len()
    }

    /// Whether the ring holds `node`.
    pub fn has(&self, node: &Node) -> bool {
        self.weights.contains_key(node.id())
    }

    /// Distinct nodes in the ring, in virtual-key order of first appearance.
    pub fn nodes(&self) -> Vec<Node> {
        let mut seen: Vec<Node> = Vec::with_capacity(self.weights.len());
        for node in self.tree.values() {
            if !seen.contains(node) {
                seen.push(node.clone());
            }
        }
        seen
    }

    /// Per-node virtual-copy counts.
    pub fn weights(&self) -> &HashMap<String, u32> {
        &self.weights
    }

    /// Hashes `data` onto the ring keyspace, memoized.
    pub fn hash_of(&self, data: &str) -> String {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(data) {
                return hit.clone();
            }
            let hashed = Self::digest(data);
            cache.put(data.to_string(), hashed.clone());
            return hashed;
        }
        Self::digest(data)
    }

    fn digest(data: &str) -> String {
        BASE64.encode(Sha256::digest(data.as_bytes()))
    }

    fn virtual_key(node: &Node, index: u32) -> String {
        format!("{}_{}", node.id(), index)
    }

    /// Inserts `node` under `weight` virtual keys (default `rfactor`). No-op
    /// when the node's first virtual key is already present.
    pub fn insert(&mut self, node: &Node, weight: Option<u32>) {
        let weight = weight.unwrap_or(self.rfactor);
        let first = self.hash_of(&Self::virtual_key(node, 1));
        if self.tree.contains_key(&first) {
            return;
        }
        for i in 1..=weight {
            let key = self.hash_of(&Self::virtual_key(node, i));
            self.tree.insert(key, node.clone());
        }
        self.weights.insert(node.id().to_string(), weight);
    }

    /// Deletes all of `node`'s virtual keys. No-op when absent.
    pub fn remove(&mut self, node: &Node) {
        let Some(weight) = self.weights.remove(node.id()) else {
            return;
        };
        for i in 1..=weight {
            let key = self.hash_of(&Self::virtual_key(node, i));
            self.tree.remove(&key);
        }
    }

    /// The node owning `data`: the smallest virtual key strictly greater than
    /// `hash(data)`, wrapping to the smallest key when none follows.
    pub fn find(&self, data: &str) -> Option<&Node> {
        if self.tree.is_empty() {
            return None;
        }
        let hashed = self.hash_of(data);
        self.tree
            .range((Excluded(hashed), Unbounded))
            .next()
            .map(|(_, node)| node)
            .or_else(|| self.tree.values().next())
    }

    /// Walks clockwise from strictly after `start`, wrapping once around.
    fn clockwise_from<'a>(&'a self, start: &'a str) -> impl Iterator<Item = &'a Node> {
        self.tree
            .range::<str, _>((Excluded(start), Unbounded))
            .chain(self.tree.range::<str, _>((Unbounded, Excluded(start))))
            .map(|(_, node)| node)
    }

    /// Walks counterclockwise from strictly before `start`, wrapping once.
    fn counterclockwise_from<'a>(&'a self, start: &'a str) -> impl Iterator<Item = &'a Node> {
        self.tree
            .range::<str, _>((Unbounded, Excluded(start)))
            .rev()
            .chain(self.tree.range::<str, _>((Excluded(start), Unbounded)).rev())
            .map(|(_, node)| node)
    }

    fn neighbor_limit(&self, k: Option<usize>) -> usize {
        let distinct = self.number_nodes();
        if distinct < 2 {
            return 0;
        }
        k.unwrap_or(self.pfactor as usize)
            .min(self.pfactor as usize)
            .min(distinct - 1)
    }

    /// Up to `min(k, pfactor, number_nodes - 1)` distinct nodes succeeding
    /// `node`, unioned across its virtual positions and skipping the node
    /// itself. Empty while the ring holds fewer than two distinct nodes.
    pub fn next(&self, node: &Node, k: Option<usize>) -> Vec<Node> {
        self.neighbors(node, k, true)
    }

    /// Symmetric to [`next`](Self::next), walking counterclockwise.
    pub fn prev(&self, node: &Node, k: Option<usize>) -> Vec<Node> {
        self.neighbors(node, k, false)
    }

    fn neighbors(&self, node: &Node, k: Option<usize>, forward: bool) -> Vec<Node> {
        if self.size() <= self.rfactor as usize {
            return Vec::new();
        }
        let limit = self.neighbor_limit(k);
        let weight = self
            .weights
            .get(node.id())
            .copied()
            .unwrap_or(self.rfactor);

        let mut out: Vec<Node> = Vec::with_capacity(limit);
        'positions: for i in 1..=weight {
            let start = self.hash_of(&Self::virtual_key(node, i));
            let walk: Box<dyn Iterator<Item = &Node> + '_> = if forward {
                Box::new(self.clockwise_from(&start))
            } else {
                Box::new(self.counterclockwise_from(&start))
            };
            for candidate in walk {
                if candidate == node || out.contains(candidate) {
                    continue;
                }
                out.push(candidate.clone());
                if out.len() >= limit {
                    break 'positions;
                }
            }
        }
        out
    }

    /// Up to `k` distinct successor nodes starting at `find(data)`, the owner
    /// first.
    pub fn range_next(&self, data: &str, k: usize) -> Vec<Node> {
        if self.tree.is_empty() || k == 0 {
            return Vec::new();
        }
        let hashed = self.hash_of(data);
        let mut out: Vec<Node> = Vec::with_capacity(k);
        for candidate in self.clockwise_from(&hashed) {
            if out.contains(candidate) {
                continue;
            }
            out.push(candidate.clone());
            if out.len() >= k {
                break;
            }
        }
        // The strict bounds skip a virtual position whose key equals the
        // hash; fall back to the first entry so the walk stays total.
        if out.is_empty() {
            if let Some(node) = self.tree.values().next() {
                out.push(node.clone());
            }
        }
        out
    }

    fn check_params(&self, other: &HashRing) -> CoreResult<()> {
        if self.rfactor != other.rfactor || self.pfactor != other.pfactor {
            return Err(CoreError::RingParamMismatch {
                local_rfactor: self.rfactor,
                local_pfactor: self.pfactor,
                remote_rfactor: other.rfactor,
                remote_pfactor: other.pfactor,
            });
        }
        Ok(())
    }

    /// Adds virtual keys present in `other` but not here. Fails when the
    /// rings disagree on `rfactor` or `pfactor`.
    pub fn merge(&mut self, other: &HashRing) -> CoreResult<()> {
        self.check_params(other)?;
        for (key, node) in &other.tree {
            self.tree.entry(key.clone()).or_insert_with(|| node.clone());
        }
        self.recount_weights();
        Ok(())
    }

    /// Keeps only virtual keys present in both rings.
    pub fn intersect(&mut self, other: &HashRing) -> CoreResult<()> {
        self.check_params(other)?;
        self.tree.retain(|key, _| other.tree.contains_key(key));
        self.recount_weights();
        Ok(())
    }

    fn recount_weights(&mut self) {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for node in self.tree.values() {
            *counts.entry(node.id().to_string()).or_insert(0) += 1;
        }
        self.weights = counts;
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("rfactor", &self.rfactor)
            .field("pfactor", &self.pfactor)
            .field("tree", &self.tree)
            .finish()
    }
}

impl Clone for HashRing {
    fn clone(&self) -> Self {
        Self {
            rfactor: self.rfactor,
            pfactor: self.pfactor,
            tree: self.tree.clone(),
            weights: self.weights.clone(),
            cache: Self::new_cache(),
        }
    }
}

impl PartialEq for HashRing {
    /// Same parameters and the same virtual-key set with equal node values.
    fn eq(&self, other: &Self) -> bool {
        self.rfactor == other.rfactor
            && self.pfactor == other.pfactor
            && self.tree == other.tree
    }
}

impl Eq for HashRing {}

impl From<RingJson> for HashRing {
    fn from(json: RingJson) -> Self {
        let mut ring = Self {
            rfactor: json.rfactor,
            pfactor: json.pfactor,
            tree: json.tree,
            weights: HashMap::new(),
            cache: Self::new_cache(),
        };
        ring.recount_weights();
        ring
    }
}

impl From<HashRing> for RingJson {
    fn from(ring: HashRing) -> Self {
        Self {
            rfactor: ring.rfactor,
            pfactor: ring.pfactor,
            tree: ring.tree,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node::new(id, "localhost", 8000)
    }

    #[test]
    fn insert_adds_rfactor_virtual_keys() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&node("a"), None);
        assert_eq!(ring.size(), 3);
        assert_eq!(ring.number_nodes(), 1);
        assert_eq!(ring.weights().get("a"), Some(&3));
    }

    #[test]
    fn insert_is_idempotent() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&node("a"), None);
        ring.insert(&node("a"), None);
        assert_eq!(ring.size(), 3);
    }

    #[test]
    fn remove_deletes_all_virtual_keys() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&node("a"), None);
        ring.insert(&node("b"), None);
        ring.remove(&node("a"));
        assert_eq!(ring.size(), 3);
        assert!(!ring.has(&node("a")));
        ring.remove(&node("a"));
        assert_eq!(ring.size(), 3);
    }

    #[test]
    fn find_is_deterministic_and_total() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&node("a"), None);
        ring.insert(&node("b"), None);
        ring.insert(&node("c"), None);
        let owner = ring.find("some-key").cloned().unwrap();
        assert_eq!(ring.find("some-key").cloned().unwrap(), owner);
        assert!(ring.nodes().contains(&owner));
    }

    #[test]
    fn find_agrees_across_equal_rings() {
        let mut a = HashRing::new(3, 2);
        let mut b = HashRing::new(3, 2);
        for id in ["x", "y", "z"] {
            a.insert(&node(id), None);
            b.insert(&node(id), None);
        }
        assert_eq!(a, b);
        for key in ["k1", "k2", "k3", "k4"] {
            assert_eq!(a.find(key), b.find(key));
        }
    }

    #[test]
    fn next_empty_on_single_node() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&node("a"), None);
        assert!(ring.next(&node("a"), None).is_empty());
        assert!(ring.prev(&node("a"), None).is_empty());
    }

    #[test]
    fn next_skips_self_and_caps_at_pfactor() {
        let mut ring = HashRing::new(3, 2);
        for id in ["a", "b", "c", "d", "e"] {
            ring.insert(&node(id), None);
        }
        let neighbors = ring.next(&node("a"), Some(10));
        assert!(!neighbors.is_empty());
        assert!(neighbors.len() <= 2);
        assert!(!neighbors.contains(&node("a")));
    }

    #[test]
    fn range_next_returns_owner_first() {
        let mut ring = HashRing::new(3, 2);
        for id in ["a", "b", "c"] {
            ring.insert(&node(id), None);
        }
        let replicas = ring.range_next("some-key", 3);
        assert_eq!(replicas.len(), 3);
        assert_eq!(&replicas[0], ring.find("some-key").unwrap());
        let distinct: std::collections::HashSet<_> =
            replicas.iter().map(|n| n.id().to_string()).collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn merge_requires_equal_params() {
        let mut a = HashRing::new(3, 2);
        let b = HashRing::new(4, 2);
        assert!(matches!(
            a.merge(&b),
            Err(CoreError::RingParamMismatch { .. })
        ));
    }

    #[test]
    fn merge_adds_missing_keys() {
        let mut a = HashRing::new(3, 2);
        let mut b = HashRing::new(3, 2);
        a.insert(&node("a"), None);
        b.insert(&node("a"), None);
        b.insert(&node("b"), None);
        a.merge(&b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.weights().get("b"), Some(&3));
    }

    #[test]
    fn intersect_keeps_common_keys() {
        let mut a = HashRing::new(3, 2);
        let mut b = HashRing::new(3, 2);
        a.insert(&node("a"), None);
        a.insert(&node("b"), None);
        b.insert(&node("b"), None);
        b.insert(&node("c"), None);
        a.intersect(&b).unwrap();
        assert_eq!(a.nodes(), vec![node("b")]);
        assert_eq!(a.size(), 3);
    }

    #[test]
    fn json_round_trip() {
        let mut ring = HashRing::new(3, 2);
        ring.insert(&node("a"), None);
        ring.insert(&node("b"), None);
        let json = serde_json::to_string(&ring).unwrap();
        let back: HashRing = serde_json::from_str(&json).unwrap();
        assert_eq!(ring, back);
        assert_eq!(back.weights().get("a"), Some(&3));
    }
}
