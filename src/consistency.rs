//! Origin consistency audit.
//!
//! Every time this node resolves an origin for a key it records the pair.
//! If one key resolved to more than one peer during a period, the ring has
//! not converged (usually mid membership churn) and we say so.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::hashring::NodeName;

#[derive(Debug, Default)]
pub struct ConsistencyChecker {
    observed: Mutex<HashMap<String, BTreeSet<NodeName>>>,
}

impl ConsistencyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, peer: &NodeName) {
        let mut observed = self.observed.lock();
        if let Some(peers) = observed.get_mut(key) {
            if !peers.contains(peer) {
                peers.insert(peer.clone());
            }
            return;
        }
        observed.insert(key.to_string(), BTreeSet::from([peer.clone()]));
    }

    /// Report keys that resolved to more than one peer and start a new period
    pub fn audit(&self) -> Vec<(String, Vec<NodeName>)> {
        let observed = std::mem::take(&mut *self.observed.lock());
        let mut inconsistent: Vec<(String, Vec<NodeName>)> = observed
            .into_iter()
            .filter(|(_, peers)| peers.len() > 1)
            .map(|(key, peers)| (key, peers.into_iter().collect()))
            .collect();
        inconsistent.sort();
        for (key, peers) in &inconsistent {
            let peers: Vec<&str> = peers.iter().map(|p| p.as_str()).collect();
            warn!(
                "Inconsistent origin for {}: resolved to {:?}; ring has not converged",
                key, peers
            );
        }
        inconsistent
    }

    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick is immediate
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.audit();
                    }
                }
            }
        })
    }
}
