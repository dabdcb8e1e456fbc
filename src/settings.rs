//! Ratemesh application settings
use std::net::SocketAddr;
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::config_error;
use crate::error::Result;
use crate::hashring::{Node, NodeName};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 8410;
pub const DEFAULT_PORT_HTTP: &str = "8410";
pub const STANDARD_PORT_TCP: u16 = 8411;
pub const DEFAULT_PORT_TCP: &str = "8411";

pub const DEFAULT_TOKENS_PER_NODE: usize = 256;
pub const DEFAULT_SYNC_WORKERS: usize = 128;
pub const DEFAULT_SYNC_QUEUE_CAPACITY: usize = 100_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// How the current request count is estimated from the two live windows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CountingPolicy {
    /// current + previous weighted by the unelapsed share of the current window
    #[default]
    WeightedSliding,
    /// current window only; up to 2x limit can pass across a boundary
    FixedWindow,
}

impl std::fmt::Display for CountingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CountingPolicy::WeightedSliding => write!(f, "weighted-sliding"),
            CountingPolicy::FixedWindow => write!(f, "fixed-window"),
        }
    }
}

impl std::str::FromStr for CountingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weighted-sliding" | "sliding" => Ok(CountingPolicy::WeightedSliding),
            "fixed-window" | "fixed" => Ok(CountingPolicy::FixedWindow),
            _ => Err(format!("Invalid counting policy: {}", s)),
        }
    }
}

/// What happens to a sync event when the queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Discard the incoming event and count it
    #[default]
    DropNewest,
    /// Wait for queue space (stalls the request path under load)
    Block,
}

impl std::fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackpressurePolicy::DropNewest => write!(f, "drop-newest"),
            BackpressurePolicy::Block => write!(f, "block"),
        }
    }
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop-newest" | "drop" => Ok(BackpressurePolicy::DropNewest),
            "block" => Ok(BackpressurePolicy::Block),
            _ => Err(format!("Invalid backpressure policy: {}", s)),
        }
    }
}

/// Whether one breaker guards a call-site for all peers or one breaker per peer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BreakerScope {
    #[default]
    Shared,
    PerPeer,
}

impl std::fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerScope::Shared => write!(f, "shared"),
            BreakerScope::PerPeer => write!(f, "per-peer"),
        }
    }
}

impl std::str::FromStr for BreakerScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(BreakerScope::Shared),
            "per-peer" | "peer" => Ok(BreakerScope::PerPeer),
            _ => Err(format!("Invalid breaker scope: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub rpc_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_SYNC_WORKERS,
            queue_capacity: DEFAULT_SYNC_QUEUE_CAPACITY,
            backpressure: BackpressurePolicy::default(),
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerSettings {
    pub scope: BreakerScope,
    pub trip_threshold: u64,
    pub cyclic_period: Duration,
    pub timeout: Duration,
    pub max_requests: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            scope: BreakerScope::default(),
            trip_threshold: 5,
            cyclic_period: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 3,
        }
    }
}

impl BreakerSettings {
    pub fn config(&self, name: &str) -> BreakerConfig {
        BreakerConfig::new(name)
            .with_trip_threshold(self.trip_threshold)
            .with_cyclic_period(self.cyclic_period)
            .with_timeout(self.timeout)
            .with_max_requests(self.max_requests)
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // Unique name of this node in the ring
    pub node_name: NodeName,

    // Server listen address
    pub listen_address: String,

    // HTTP API listen port
    pub listen_port: u16,

    // TCP listen port for peer RPC
    pub listen_port_tcp: u16,

    // Cluster configuration information: peers and their RPC addresses
    pub topology: Vec<Node>,

    // Virtual replicas per node on the hash ring
    pub tokens_per_node: usize,

    // Window estimate used by the limiter
    pub counting_policy: CountingPolicy,

    // How often stale windows are swept
    pub expire_interval: Duration,

    // How often the origin consistency audit runs
    pub consistency_interval: Duration,

    pub sync: SyncSettings,
    pub breaker: BreakerSettings,
}

impl Settings {
    /// Defaults for a node with no peers; mostly useful in tests.
    pub fn for_node(name: &str) -> Self {
        Self {
            node_name: NodeName::from(name),
            listen_address: "127.0.0.1".to_string(),
            listen_port: STANDARD_PORT_HTTP,
            listen_port_tcp: STANDARD_PORT_TCP,
            topology: Vec::new(),
            tokens_per_node: DEFAULT_TOKENS_PER_NODE,
            counting_policy: CountingPolicy::default(),
            expire_interval: Duration::from_secs(60),
            consistency_interval: Duration::from_secs(60),
            sync: SyncSettings::default(),
            breaker: BreakerSettings::default(),
        }
    }

    pub fn http_listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.listen_port)
            .parse()
            .map_err(|e| config_error!("Invalid HTTP listen address: {}", e))
    }

    pub fn rpc_listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.listen_address, self.listen_port_tcp)
            .parse()
            .map_err(|e| config_error!("Invalid RPC listen address: {}", e))
    }

    /// This node as a ring member
    pub fn local_node(&self) -> Node {
        Node::new(
            self.node_name.clone(),
            format!("{}:{}", self.listen_address, self.listen_port_tcp),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokens_per_node == 0 {
            return Err(config_error!("tokens-per-node must be at least 1"));
        }
        if self.sync.workers == 0 {
            return Err(config_error!("sync-workers must be at least 1"));
        }
        if self.sync.queue_capacity == 0 {
            return Err(config_error!("sync-queue-capacity must be at least 1"));
        }
        if self.breaker.trip_threshold == 0 || self.breaker.max_requests == 0 {
            return Err(config_error!(
                "breaker trip threshold and max requests must be at least 1"
            ));
        }
        if self.topology.iter().any(|n| n.id == self.node_name) {
            return Err(config_error!(
                "topology must not list this node ({})",
                self.node_name
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn sample() -> Settings {
        Settings::for_node("node-a")
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "fixed-window".parse::<CountingPolicy>().unwrap(),
            CountingPolicy::FixedWindow
        );
        assert_eq!(
            "Weighted-Sliding".parse::<CountingPolicy>().unwrap(),
            CountingPolicy::WeightedSliding
        );
        assert!("leaky".parse::<CountingPolicy>().is_err());
        assert_eq!(
            "block".parse::<BackpressurePolicy>().unwrap(),
            BackpressurePolicy::Block
        );
        assert_eq!(
            "per-peer".parse::<BreakerScope>().unwrap(),
            BreakerScope::PerPeer
        );
    }

    #[test]
    fn test_validate() {
        let mut conf = sample();
        assert!(conf.validate().is_ok());
        assert_eq!(conf.local_node().rpc_address, "127.0.0.1:8411");

        conf.topology = vec![Node::new("node-a".into(), "127.0.0.1:9000".to_string())];
        assert!(conf.validate().is_err());

        let mut conf = sample();
        conf.sync.workers = 0;
        assert!(conf.validate().is_err());
    }
}
