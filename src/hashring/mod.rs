pub mod node;
pub mod ring;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use node::{Node, NodeName};
pub use ring::{stable_hash, HashRing};

use crate::cluster::Membership;
use crate::metrics::Metrics;

/// Seed the ring with current members, then follow join/leave events.
///
/// Subscriptions are taken before seeding so no change is missed in between.
/// Every event re-reads the membership, so a join and leave handled out of
/// order still leave the ring matching the live members.
pub fn spawn_ring_sync(
    ring: Arc<HashRing>,
    membership: Arc<dyn Membership>,
    metrics: Arc<dyn Metrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut joins = membership.subscribe_join_events();
    let mut leaves = membership.subscribe_leave_events();
    let node_id = membership.node_id();

    for member in membership.members() {
        if !ring.contains(&member.id) {
            if let Err(e) = ring.add_node(member) {
                warn!("[Node<{}>] failed to seed ring: {}", node_id, e);
            }
        }
    }
    metrics.ring_size(ring.len());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Node<{}>] ring sync stopping", node_id);
                    break;
                }
                joined = joins.recv() => match joined {
                    Ok(node) => debug!("[Node<{}>] {} joined", node_id, node.id),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[Node<{}>] ring sync lagged {} join events", node_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                left = leaves.recv() => match left {
                    Ok(node) => debug!("[Node<{}>] {} left", node_id, node.id),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[Node<{}>] ring sync lagged {} leave events", node_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
            // the two feeds are not ordered against each other, so events
            // only wake the task and the membership snapshot decides
            reconcile(&ring, membership.as_ref(), &node_id);
            metrics.ring_size(ring.len());
        }
    })
}

/// Bring the ring in line with the membership snapshot
fn reconcile(ring: &HashRing, membership: &dyn Membership, node_id: &NodeName) {
    let members = membership.members();
    for node in ring.members() {
        if !members.iter().any(|m| m.id == node.id) {
            info!("[Node<{}>] removing {} from ring", node_id, node.id);
            ring.remove_node(&node.id);
        }
    }
    for member in members {
        if !ring.contains(&member.id) {
            info!("[Node<{}>] adding {} to ring", node_id, member.id);
            if let Err(e) = ring.add_node(member) {
                warn!("[Node<{}>] ring add failed: {}", node_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::StaticMembership;
    use crate::metrics::AtomicMetrics;

    fn node(name: &str) -> Node {
        Node::new(NodeName::from(name), format!("{}:8411", name))
    }

    #[tokio::test]
    async fn test_ring_follows_membership() {
        let membership = Arc::new(StaticMembership::new(node("a"), vec![node("b")]));
        let ring = Arc::new(HashRing::new(16));
        let metrics = Arc::new(AtomicMetrics::default());
        let cancel = CancellationToken::new();

        let handle = spawn_ring_sync(
            ring.clone(),
            membership.clone(),
            metrics.clone(),
            cancel.clone(),
        );
        assert_eq!(ring.len(), 2);

        membership.join(node("c")).unwrap();
        membership.leave(&NodeName::from("b")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let names: Vec<String> = ring.members().iter().map(|n| n.id.to_string()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(metrics.snapshot().ring_size, 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_join_then_leave_never_strands_node() {
        let membership = Arc::new(StaticMembership::new(node("a"), vec![node("b")]));
        let ring = Arc::new(HashRing::new(16));
        let metrics = Arc::new(AtomicMetrics::default());
        let cancel = CancellationToken::new();
        let handle = spawn_ring_sync(ring.clone(), membership.clone(), metrics, cancel.clone());

        let departed = NodeName::from("c");
        for round in 0..200 {
            membership.join(node("c")).unwrap();
            membership.leave(&departed).unwrap();

            let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
            while ring.contains(&departed) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            assert!(!ring.contains(&departed), "c stranded in ring after round {}", round);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ring.contains(&departed));
        assert_eq!(ring.len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
