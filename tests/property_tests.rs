use ratemesh::hashring::{HashRing, Node, NodeName};
use ratemesh::limiters::{BucketKey, RateLimiter, RatelimitRequest, SetCounterRequest};
use ratemesh::settings::CountingPolicy;
use proptest::prelude::*;

fn ring_from(names: &[String]) -> HashRing {
    let ring = HashRing::new(64);
    for name in names {
        ring.add_node(Node::new(NodeName::from(name.as_str()), format!("{}:8411", name)))
            .unwrap();
    }
    ring
}

proptest! {
    #[test]
    fn test_set_counters_keeps_maximum_property(
        counters in prop::collection::vec(0i64..10_000, 1..50)
    ) {
        let limiter = RateLimiter::new(CountingPolicy::FixedWindow);
        let key = BucketKey::new("merge", 100, 1_000);
        for counter in &counters {
            limiter.set_counters(&[SetCounterRequest {
                key: key.clone(),
                sequence: 42,
                counter: *counter,
            }]);
        }
        let stored = limiter.peek_window(&key, 42).unwrap().counter;
        prop_assert_eq!(stored, *counters.iter().max().unwrap());
    }

    #[test]
    fn test_ring_ignores_insertion_order_property(
        names in prop::collection::hash_set("[a-z]{3,8}", 1..8),
        keys in prop::collection::vec("[a-zA-Z0-9:_-]{1,24}", 1..50)
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let mut reversed = names.clone();
        reversed.reverse();
        let forward = ring_from(&names);
        let backward = ring_from(&reversed);
        for key in &keys {
            prop_assert_eq!(forward.find_node(key).unwrap(), backward.find_node(key).unwrap());
        }
    }

    #[test]
    fn test_find_nodes_distinct_property(
        names in prop::collection::hash_set("[a-z]{3,8}", 1..8),
        key in "[a-zA-Z0-9]{1,24}",
        n in 1usize..10
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let ring = ring_from(&names);
        let nodes = ring.find_nodes(&key, n).unwrap();
        prop_assert_eq!(nodes.len(), n.min(names.len()));
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                prop_assert_ne!(&a.id, &b.id);
            }
        }
    }

    #[test]
    fn test_admitted_cost_never_exceeds_limit_property(
        costs in prop::collection::vec(0i64..5, 1..100),
        limit in 1i64..50
    ) {
        let limiter = RateLimiter::new(CountingPolicy::FixedWindow);
        let mut admitted = 0;
        for cost in costs {
            let outcome = limiter
                .take(&RatelimitRequest::new("prop", limit, 60_000, cost), 30_000)
                .unwrap();
            prop_assert!(outcome.response.remaining >= 0);
            if outcome.response.pass {
                admitted += cost;
            }
        }
        prop_assert!(admitted <= limit);
    }
}
