use std::collections::HashMap;

use rand::Rng;
use ratemesh::hashring::{HashRing, Node, NodeName};

fn node(i: usize) -> Node {
    Node::new(
        NodeName::from(format!("node-{}", i)),
        format!("10.0.0.{}:8411", i),
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
fn test_random_keys_spread_evenly() {
    let ring = ring_with(10);
    let mut rng = rand::rng();
    let mut counts: HashMap<NodeName, u64> = HashMap::new();
    for _ in 0..50_000 {
        let key = format!("key-{}", rng.random::<u64>());
        for node in ring.find_nodes(&key, 3).unwrap() {
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
fn test_adding_a_node_only_moves_keys_to_it() {
    let ring = ring_with(5);
    let keys: Vec<String> = (0..20_000).map(|i| format!("client-{}", i)).collect();
    let before: Vec<NodeName> = keys.iter().map(|k| ring.find_node(k).unwrap().id).collect();

    let added = node(5);
    ring.add_node(added.clone()).unwrap();

    let mut moved = 0;
    for (key, owner) in keys.iter().zip(before.iter()) {
        let now = ring.find_node(key).unwrap().id;
        if &now != owner {
            moved += 1;
            assert_eq!(now, added.id, "key {} moved between surviving nodes", key);
        }
    }
    let share = moved as f64 / keys.len() as f64;
    assert!(share > 0.05 && share < 0.40, "moved share {}", share);
}
