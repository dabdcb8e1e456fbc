//! In-process peer client: calls other nodes' handlers directly.
//! Lets a whole cluster run inside one test binary.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::client::PeerClient;
use super::messages::{MitigateRequest, PushPullRequest, PushPullResponse};
use super::server::PeerHandler;
use crate::error::Result;
use crate::hashring::{Node, NodeName};
use crate::transport_error;

#[derive(Default)]
pub struct LoopbackPeers {
    handlers: RwLock<HashMap<NodeName, Weak<dyn PeerHandler>>>,
    unreachable: RwLock<HashSet<NodeName>>,
}

impl std::fmt::Debug for LoopbackPeers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPeers")
            .field("handlers", &self.handlers.read().len())
            .field("unreachable", &*self.unreachable.read())
            .finish()
    }
}

impl LoopbackPeers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node_id: NodeName, handler: Weak<dyn PeerHandler>) {
        self.handlers.write().insert(node_id, handler);
    }

    /// Simulate a partition: calls to this node fail with a transport error
    pub fn set_unreachable(&self, node_id: &NodeName, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(node_id.clone());
        } else {
            set.remove(node_id);
        }
    }

    fn handler(&self, peer: &Node) -> Result<Arc<dyn PeerHandler>> {
        if self.unreachable.read().contains(&peer.id) {
            return Err(transport_error!("{} is unreachable", peer.id));
        }
        self.handlers
            .read()
            .get(&peer.id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| transport_error!("No handler registered for {}", peer.id))
    }
}

#[async_trait]
impl PeerClient for LoopbackPeers {
    async fn push_pull(&self, peer: &Node, request: PushPullRequest) -> Result<PushPullResponse> {
        let handler = self.handler(peer)?;
        handler.push_pull(request).await
    }

    async fn mitigate(&self, peer: &Node, request: MitigateRequest) -> Result<()> {
        let handler = self.handler(peer)?;
        handler.mitigate(request).await
    }
}
