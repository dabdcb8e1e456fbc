//! Consistent hash ring with virtual replicas.
//!
//! Each node is placed on the ring `tokens_per_node` times at the hash of
//! `"{node_id}-{i}"`. A key belongs to the first token at or after its own
//! hash, wrapping around to the first token. Adding or removing one node
//! only moves the keys that land on that node's tokens.
use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::node::{Node, NodeName};
use crate::error::Result;
use crate::routing_error;

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Stable 64-bit hash: FNV-1a followed by the murmur3 finalizer.
///
/// FNV-1a alone barely moves the high bits for keys that differ only in
/// their last bytes, which clusters tokens like `node-1-0`, `node-1-1`.
pub fn stable_hash(key: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51afd7ed558ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ceb9fe1a85ec53);
    hash ^= hash >> 33;
    hash
}

/// A virtual replica of a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub hash: u64,
    pub node_id: NodeName,
}

#[derive(Debug, Default)]
struct RingState {
    // always sorted by hash
    tokens: Vec<Token>,
    nodes: HashMap<NodeName, Node>,
}

impl RingState {
    /// Index of the first token with hash >= key hash, wrapping to 0
    fn successor(&self, key: &str) -> usize {
        let hash = stable_hash(key);
        let idx = self.tokens.partition_point(|token| token.hash < hash);
        if idx == self.tokens.len() {
            0
        } else {
            idx
        }
    }
}

#[derive(Debug)]
pub struct HashRing {
    tokens_per_node: usize,
    state: RwLock<RingState>,
}

impl HashRing {
    pub fn new(tokens_per_node: usize) -> Self {
        Self {
            tokens_per_node: tokens_per_node.max(1),
            state: RwLock::new(RingState::default()),
        }
    }

    pub fn tokens_per_node(&self) -> usize {
        self.tokens_per_node
    }

    pub fn add_node(&self, node: Node) -> Result<()> {
        let mut state = self.state.write();
        if state.nodes.contains_key(&node.id) {
            return Err(routing_error!("Node {} is already in the ring", node.id));
        }
        state.tokens.reserve(self.tokens_per_node);
        for i in 0..self.tokens_per_node {
            state.tokens.push(Token {
                hash: stable_hash(&format!("{}-{}", node.id, i)),
                node_id: node.id.clone(),
            });
        }
        state.tokens.sort_by_key(|token| token.hash);
        debug!(
            "Added node {} to ring ({} tokens total)",
            node.id,
            state.tokens.len()
        );
        state.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Removing an unknown node is a no-op
    pub fn remove_node(&self, node_id: &NodeName) -> Option<Node> {
        let mut state = self.state.write();
        let removed = state.nodes.remove(node_id)?;
        state.tokens.retain(|token| &token.node_id != node_id);
        debug!(
            "Removed node {} from ring ({} tokens total)",
            node_id,
            state.tokens.len()
        );
        Some(removed)
    }

    pub fn find_node(&self, key: &str) -> Result<Node> {
        let state = self.state.read();
        if state.tokens.is_empty() {
            return Err(routing_error!("Hash ring is empty"));
        }
        let token = &state.tokens[state.successor(key)];
        state
            .nodes
            .get(&token.node_id)
            .cloned()
            .ok_or_else(|| routing_error!("Token points at unknown node {}", token.node_id))
    }

    /// Walk the ring from the key's successor collecting up to `n` distinct nodes
    pub fn find_nodes(&self, key: &str, n: usize) -> Result<Vec<Node>> {
        let state = self.state.read();
        if state.tokens.is_empty() {
            return Err(routing_error!("Hash ring is empty"));
        }
        let wanted = n.min(state.nodes.len());
        let start = state.successor(key);
        let mut found: Vec<Node> = Vec::with_capacity(wanted);
        for offset in 0..state.tokens.len() {
            if found.len() >= wanted {
                break;
            }
            let token = &state.tokens[(start + offset) % state.tokens.len()];
            if found.iter().any(|node| node.id == token.node_id) {
                continue;
            }
            if let Some(node) = state.nodes.get(&token.node_id) {
                found.push(node.clone());
            }
        }
        Ok(found)
    }

    pub fn contains(&self, node_id: &NodeName) -> bool {
        self.state.read().nodes.contains_key(node_id)
    }

    pub fn members(&self) -> Vec<Node> {
        let mut members: Vec<Node> = self.state.read().nodes.values().cloned().collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().nodes.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.state.read().tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn node(i: usize) -> Node {
        Node::new(
            NodeName::from(format!("node-{}", i)),
            format!("127.0.0.1:{}", 9000 + i),
        )
    }

    fn ring_with(count: usize) -> HashRing {
        let ring = HashRing::new(256);
        for i in 0..count {
            ring.add_node(node(i)).unwrap();
        }
        ring
    }

    #[test]
    fn test_stable_hash_is_stable() {
        assert_eq!(stable_hash("identifier"), stable_hash("identifier"));
        assert_ne!(stable_hash("node-1-0"), stable_hash("node-1-1"));
    }

    #[test]
    fn test_tokens_sorted() {
        let ring = ring_with(4);
        let state = ring.state.read();
        assert_eq!(state.tokens.len(), 4 * 256);
        assert!(state.tokens.windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn test_empty_ring_fails() {
        let ring = HashRing::new(256);
        assert!(ring.find_node("key").is_err());
        assert!(ring.find_nodes("key", 3).is_err());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let ring = ring_with(1);
        assert!(ring.add_node(node(0)).is_err());
        assert_eq!(ring.token_count(), 256);
    }

    #[test]
    fn test_remove_node() {
        let ring = ring_with(3);
        assert!(ring.remove_node(&node(1).id).is_some());
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.token_count(), 2 * 256);
        // unknown node is a no-op
        assert!(ring.remove_node(&NodeName::from("nope")).is_none());
        assert_eq!(ring.len(), 2);
        for i in 0..200 {
            assert_ne!(ring.find_node(&format!("k{}", i)).unwrap().id, node(1).id);
        }
    }

    #[test]
    fn test_find_node_deterministic() {
        let first = ring_with(5);
        let second = ring_with(5);
        for i in 0..500 {
            let key = format!("key-{}", i);
            assert_eq!(first.find_node(&key).unwrap(), second.find_node(&key).unwrap());
        }
    }

    #[test]
    fn test_find_nodes_distinct() {
        let ring = ring_with(5);
        let nodes = ring.find_nodes("some-key", 3).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_ne!(nodes[0].id, nodes[1].id);
        assert_ne!(nodes[1].id, nodes[2].id);
        assert_ne!(nodes[0].id, nodes[2].id);
        // first replica is the primary owner
        assert_eq!(nodes[0], ring.find_node("some-key").unwrap());
        // asking for more than exist returns every node once
        assert_eq!(ring.find_nodes("some-key", 10).unwrap().len(), 5);
    }

    #[test]
    fn test_distribution_uniformity() {
        let ring = ring_with(10);
        let mut counts: HashMap<NodeName, u64> = HashMap::new();
        for i in 0..50_000 {
            for node in ring.find_nodes(&format!("key-{}", i), 3).unwrap() {
                *counts.entry(node.id).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 10);
        let values: Vec<f64> = counts.values().map(|c| *c as f64).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let relative_std_dev = variance.sqrt() / mean;
        assert!(
            relative_std_dev <= 0.05,
            "relative standard deviation too high: {}",
            relative_std_dev
        );
    }

    #[test]
    fn test_removal_only_moves_removed_nodes_keys() {
        let ring = ring_with(5);
        let keys: Vec<String> = (0..20_000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<NodeName> = keys
            .iter()
            .map(|k| ring.find_node(k).unwrap().id)
            .collect();

        let removed = node(2).id;
        ring.remove_node(&removed);

        let mut moved = 0;
        for (key, owner) in keys.iter().zip(before.iter()) {
            let now = ring.find_node(key).unwrap().id;
            if &now != owner {
                moved += 1;
                assert_eq!(owner, &removed, "key {} moved off a surviving node", key);
            }
        }
        let share = moved as f64 / keys.len() as f64;
        // roughly 1/N of the keys, never a majority
        assert!(share > 0.05 && share < 0.40, "moved share {}", share);
    }
}
