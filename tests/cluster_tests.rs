use std::sync::Arc;
use std::time::Duration;

use ratemesh::hashring::{HashRing, Node, NodeName};
use ratemesh::limiters::RatelimitRequest;
use ratemesh::metrics::AtomicMetrics;
use ratemesh::rpc::{LoopbackPeers, PeerHandler, PeerServer, TcpPeerClient};
use ratemesh::service::RatelimitService;
use ratemesh::settings::{CountingPolicy, Settings};
use tokio_util::sync::CancellationToken;

const WINDOW_START: i64 = 1_000_000;
const NOW: i64 = WINDOW_START + 100;

struct Member {
    service: Arc<RatelimitService>,
    metrics: Arc<AtomicMetrics>,
}

struct Cluster {
    members: Vec<Member>,
    peers: Arc<LoopbackPeers>,
    cancel: CancellationToken,
}

fn settings(name: &str, policy: CountingPolicy) -> Settings {
    let mut settings = Settings::for_node(name);
    settings.counting_policy = policy;
    settings.sync.workers = 4;
    settings.sync.rpc_timeout = Duration::from_millis(500);
    settings
}

impl Cluster {
    fn start(names: &[&str], policy: CountingPolicy) -> Self {
        let peers = LoopbackPeers::new();
        let cancel = CancellationToken::new();
        let members = names
            .iter()
            .map(|name| {
                let ring = Arc::new(HashRing::new(256));
                for other in names {
                    ring.add_node(Node::new(NodeName::from(*other), "loopback".to_string()))
                        .unwrap();
                }
                let metrics = Arc::new(AtomicMetrics::default());
                let service = Arc::new(RatelimitService::new(
                    &settings(name, policy),
                    ring,
                    peers.clone(),
                    metrics.clone(),
                ));
                let handler: Arc<dyn PeerHandler> = service.clone();
                peers.register(NodeName::from(*name), Arc::downgrade(&handler));
                service.spawn_background(cancel.clone());
                Member { service, metrics }
            })
            .collect();
        Self {
            members,
            peers,
            cancel,
        }
    }

    fn origin_of(&self, request: &RatelimitRequest) -> usize {
        let origin = self.members[0]
            .service
            .ring()
            .find_node(&request.bucket_key().to_string())
            .unwrap();
        self.members
            .iter()
            .position(|m| m.service.node_id() == &origin.id)
            .unwrap()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

async fn round_robin_overshoot_is_bounded(policy: CountingPolicy) {
    let cluster = Cluster::start(&["node-a", "node-b", "node-c"], policy);
    let request = RatelimitRequest::new("k1", 5, 1_000, 1).at(NOW);

    let mut passed = 0;
    for i in 0..15 {
        let member = &cluster.members[i % 3];
        let response = member.service.ratelimit(request.clone()).await.unwrap();
        if response.pass {
            passed += 1;
        } else {
            assert_eq!(response.remaining, 0);
        }
        settle().await;
    }

    let nodes = cluster.members.len() as i64;
    assert!(passed >= 5, "admitted only {}", passed);
    assert!(passed <= 5 + (nodes - 1), "admitted {}", passed);
}

#[tokio::test]
async fn test_round_robin_overshoot_is_bounded_fixed_window() {
    round_robin_overshoot_is_bounded(CountingPolicy::FixedWindow).await;
}

#[tokio::test]
async fn test_round_robin_overshoot_is_bounded_weighted_sliding() {
    round_robin_overshoot_is_bounded(CountingPolicy::WeightedSliding).await;
}

async fn mitigation_caps_peers_without_push_pull(policy: CountingPolicy) {
    let cluster = Cluster::start(&["node-a", "node-b", "node-c"], policy);
    let request = RatelimitRequest::new("k2", 5, 1_000, 1).at(NOW);
    let origin = cluster.origin_of(&request);

    for _ in 0..5 {
        let response = cluster.members[origin]
            .service
            .ratelimit(request.clone())
            .await
            .unwrap();
        assert!(response.pass);
    }
    settle().await;

    let key = request.bucket_key();
    let sequence = key.sequence_at(NOW);
    for (i, member) in cluster.members.iter().enumerate() {
        let window = member
            .service
            .limiter()
            .peek_window(&key, sequence)
            .unwrap();
        assert!(window.counter >= 5, "node {} counter {}", i, window.counter);
        if i != origin {
            assert_eq!(member.metrics.snapshot().mitigations_received, 1);
        }
    }
    assert_eq!(cluster.members[origin].metrics.snapshot().mitigations_sent, 2);

    // a peer that never asked the origin now rejects on its own
    let other = (origin + 1) % 3;
    let response = cluster.members[other]
        .service
        .ratelimit(request)
        .await
        .unwrap();
    assert!(!response.pass);
}

#[tokio::test]
async fn test_mitigation_caps_peers_without_push_pull_fixed_window() {
    mitigation_caps_peers_without_push_pull(CountingPolicy::FixedWindow).await;
}

#[tokio::test]
async fn test_mitigation_caps_peers_without_push_pull_weighted_sliding() {
    mitigation_caps_peers_without_push_pull(CountingPolicy::WeightedSliding).await;
}

#[tokio::test]
async fn test_weighted_mitigation_carries_previous_window() {
    let cluster = Cluster::start(
        &["node-a", "node-b", "node-c"],
        CountingPolicy::WeightedSliding,
    );
    let request = RatelimitRequest::new("k3", 10, 1_000, 1);
    let origin = cluster.origin_of(&request);
    let origin_service = &cluster.members[origin].service;

    // fill the previous window on the origin
    for _ in 0..10 {
        let response = origin_service
            .ratelimit(request.clone().at(WINDOW_START - 500))
            .await
            .unwrap();
        assert!(response.pass);
    }
    settle().await;

    // a quarter into the next window 7.5 requests carry over, so two more fill it
    let later = request.clone().at(WINDOW_START + 250);
    let mut decisions = Vec::new();
    for _ in 0..3 {
        decisions.push(origin_service.ratelimit(later.clone()).await.unwrap().pass);
    }
    assert_eq!(decisions, vec![true, true, false]);
    settle().await;

    let key = request.bucket_key();
    let sequence = key.sequence_at(WINDOW_START + 250);
    for (i, member) in cluster.members.iter().enumerate() {
        let limiter = member.service.limiter();
        let current = limiter.peek_window(&key, sequence).unwrap();
        let previous = limiter.peek_window(&key, sequence - 1).unwrap();
        assert_eq!(current.counter, 2, "node {}", i);
        assert_eq!(previous.counter, 10, "node {}", i);
        if i != origin {
            assert_eq!(member.metrics.snapshot().mitigations_received, 2);
            let response = member.service.ratelimit(later.clone()).await.unwrap();
            assert!(!response.pass, "node {} admitted past the carried limit", i);
        }
    }
    assert_eq!(cluster.members[origin].metrics.snapshot().mitigations_sent, 4);
}

#[tokio::test]
async fn test_unreachable_origin_trips_breaker_but_keeps_answering() {
    let cluster = Cluster::start(&["node-a", "node-b"], CountingPolicy::FixedWindow);
    let origin = NodeName::from("node-b");
    cluster.peers.set_unreachable(&origin, true);
    let caller = &cluster.members[0];

    let requests: Vec<RatelimitRequest> = (0..)
        .map(|i| RatelimitRequest::new(&format!("user-{}", i), 10, 1_000, 1).at(NOW))
        .filter(|r| cluster.origin_of(r) == 1)
        .take(8)
        .collect();
    for request in requests {
        let response = caller.service.ratelimit(request).await.unwrap();
        assert!(response.pass);
    }

    let snapshot = caller.metrics.snapshot();
    assert_eq!(snapshot.origin_fallbacks, 8);
    assert!(snapshot.breaker_opened >= 1);
    assert_eq!(snapshot.decisions_passed, 8);
}

#[tokio::test]
async fn test_push_pull_over_tcp() {
    let cancel = CancellationToken::new();
    let servers = vec![
        PeerServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
        PeerServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
    ];
    let nodes: Vec<Node> = servers
        .iter()
        .enumerate()
        .map(|(i, server)| {
            Node::new(
                NodeName::from(format!("tcp-{}", i)),
                server.local_addr.to_string(),
            )
        })
        .collect();

    let mut services = Vec::new();
    for (server, node) in servers.into_iter().zip(nodes.iter()) {
        let ring = Arc::new(HashRing::new(256));
        for member in &nodes {
            ring.add_node(member.clone()).unwrap();
        }
        let service = Arc::new(RatelimitService::new(
            &settings(node.id.as_str(), CountingPolicy::FixedWindow),
            ring,
            Arc::new(TcpPeerClient::new()),
            Arc::new(AtomicMetrics::default()),
        ));
        service.spawn_background(cancel.clone());
        server.spawn(service.clone(), cancel.clone());
        services.push(service);
    }

    let request = (0..)
        .map(|i| RatelimitRequest::new(&format!("tcp-user-{}", i), 3, 1_000, 1).at(NOW))
        .find(|r| {
            services[0]
                .ring()
                .find_node(&r.bucket_key().to_string())
                .unwrap()
                .id
                .as_str()
                == "tcp-1"
        })
        .unwrap();

    // cold on tcp-0: answered by tcp-1 over the wire
    let response = services[0].ratelimit(request.clone()).await.unwrap();
    assert!(response.pass);
    assert_eq!(response.remaining, 2);

    let key = request.bucket_key();
    let sequence = key.sequence_at(NOW);
    assert_eq!(
        services[1].limiter().peek_window(&key, sequence).unwrap().counter,
        1
    );
    assert_eq!(
        services[0].limiter().peek_window(&key, sequence).unwrap().counter,
        1
    );

    // warm on tcp-0: decided locally, origin catches up in the background
    assert!(services[0].ratelimit(request).await.unwrap().pass);
    settle().await;
    assert_eq!(
        services[1].limiter().peek_window(&key, sequence).unwrap().counter,
        2
    );

    cancel.cancel();
}
