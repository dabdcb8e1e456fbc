//! Cluster membership as consumed by the rate limiter.
//! Discovery and failure detection live outside this crate; what we need
//! is who we are, who else is alive, and a feed of joins and leaves.
use std::collections::BTreeMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::hashring::{Node, NodeName};
use crate::invalid_request;

const EVENT_BUFFER: usize = 1024;

pub trait Membership: Send + Sync {
    /// Name of the local node
    fn node_id(&self) -> NodeName;

    /// Every live member, the local node included
    fn members(&self) -> Vec<Node>;

    fn subscribe_join_events(&self) -> broadcast::Receiver<Node>;

    fn subscribe_leave_events(&self) -> broadcast::Receiver<Node>;
}

/// Membership seeded from configuration and changed by operators.
pub struct StaticMembership {
    local: Node,
    peers: RwLock<BTreeMap<NodeName, Node>>,
    join_tx: broadcast::Sender<Node>,
    leave_tx: broadcast::Sender<Node>,
}

impl std::fmt::Debug for StaticMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticMembership")
            .field("local", &self.local)
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

impl StaticMembership {
    pub fn new(local: Node, peers: Vec<Node>) -> Self {
        let (join_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (leave_tx, _) = broadcast::channel(EVENT_BUFFER);
        let peers = peers
            .into_iter()
            .filter(|peer| peer.id != local.id)
            .map(|peer| (peer.id.clone(), peer))
            .collect();
        Self {
            local,
            peers: RwLock::new(peers),
            join_tx,
            leave_tx,
        }
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Add a member and announce it to subscribers
    pub fn join(&self, node: Node) -> Result<()> {
        if node.id == self.local.id {
            return Err(invalid_request!("{} is the local node", node.id));
        }
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&node.id) {
                return Err(invalid_request!("{} is already a member", node.id));
            }
            peers.insert(node.id.clone(), node.clone());
        }
        info!("[Node<{}>] member joined: {}", self.local.id, node.id);
        // no subscribers is fine
        let _ = self.join_tx.send(node);
        Ok(())
    }

    /// Remove a member and announce it to subscribers
    pub fn leave(&self, node_id: &NodeName) -> Result<Node> {
        let node = self
            .peers
            .write()
            .remove(node_id)
            .ok_or_else(|| invalid_request!("{} is not a member", node_id))?;
        info!("[Node<{}>] member left: {}", self.local.id, node.id);
        let _ = self.leave_tx.send(node.clone());
        Ok(node)
    }
}

impl Membership for StaticMembership {
    fn node_id(&self) -> NodeName {
        self.local.id.clone()
    }

    fn members(&self) -> Vec<Node> {
        let mut members = vec![self.local.clone()];
        members.extend(self.peers.read().values().cloned());
        members
    }

    fn subscribe_join_events(&self) -> broadcast::Receiver<Node> {
        self.join_tx.subscribe()
    }

    fn subscribe_leave_events(&self) -> broadcast::Receiver<Node> {
        self.leave_tx.subscribe()
    }
}
