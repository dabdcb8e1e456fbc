//! CLI for this application
//!
use std::time::Duration;

use crate::error::Result;
use crate::hashring::{Node, NodeName};
use crate::settings::{self, BackpressurePolicy, BreakerScope, CountingPolicy};

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Unique name of this node in the ring
    #[clap(
        long,
        env("RATEMESH_NODE_NAME"),
        help = "Name of this node; derived from listen address and TCP port if absent"
    )]
    pub node_name: Option<String>,

    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("RATEMESH_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("RATEMESH_HTTP_LISTEN_PORT"),
        help = "Port to bind the HTTP API server to"
    )]
    pub listen_port: u16,

    // TCP listen port for peer RPC
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_TCP,
        env("RATEMESH_TCP_LISTEN_PORT"),
        help = "Port to bind the peer RPC server to"
    )]
    pub listen_port_tcp: u16,

    // Cluster configuration information: topology
    #[clap(
        long,
        env("RATEMESH_TOPOLOGY"),
        value_delimiter = ',',
        help = "Peer RPC addresses as name=host:port (e.g., node-b=10.0.0.2:8411,node-c=10.0.0.3:8411). If empty, runs as a single node."
    )]
    pub topology: Vec<Node>,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_TOKENS_PER_NODE,
        env("RATEMESH_TOKENS_PER_NODE"),
        help = "Virtual replicas per node on the hash ring"
    )]
    pub tokens_per_node: usize,

    #[clap(
        long,
        default_value = "weighted-sliding",
        env("RATEMESH_COUNTING_POLICY"),
        help = "Window estimate: 'weighted-sliding' or 'fixed-window'"
    )]
    pub counting_policy: CountingPolicy,

    #[clap(
        long,
        default_value = "60",
        env("RATEMESH_EXPIRE_INTERVAL_SECS"),
        help = "Seconds between sweeps of expired windows"
    )]
    pub expire_interval_secs: u64,

    #[clap(
        long,
        default_value = "60",
        env("RATEMESH_CONSISTENCY_INTERVAL_SECS"),
        help = "Seconds between origin consistency audits"
    )]
    pub consistency_interval_secs: u64,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SYNC_WORKERS,
        env("RATEMESH_SYNC_WORKERS"),
        help = "Workers draining the sync queue"
    )]
    pub sync_workers: usize,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_SYNC_QUEUE_CAPACITY,
        env("RATEMESH_SYNC_QUEUE_CAPACITY"),
        help = "Bound of the sync queue"
    )]
    pub sync_queue_capacity: usize,

    #[clap(
        long,
        default_value = "drop-newest",
        env("RATEMESH_BACKPRESSURE"),
        help = "When the sync queue is full: 'drop-newest' or 'block'"
    )]
    pub backpressure: BackpressurePolicy,

    #[clap(
        long,
        default_value_t = settings::DEFAULT_RPC_TIMEOUT_MS,
        env("RATEMESH_RPC_TIMEOUT_MS"),
        help = "Deadline for each peer RPC in milliseconds"
    )]
    pub rpc_timeout_ms: u64,

    #[clap(
        long,
        default_value = "shared",
        env("RATEMESH_BREAKER_SCOPE"),
        help = "Circuit breakers per call-site ('shared') or per call-site and peer ('per-peer')"
    )]
    pub breaker_scope: BreakerScope,

    #[clap(long, default_value = "5", env("RATEMESH_BREAKER_TRIP_THRESHOLD"))]
    pub breaker_trip_threshold: u64,

    #[clap(long, default_value = "60", env("RATEMESH_BREAKER_CYCLIC_PERIOD_SECS"))]
    pub breaker_cyclic_period_secs: u64,

    #[clap(long, default_value = "30", env("RATEMESH_BREAKER_TIMEOUT_SECS"))]
    pub breaker_timeout_secs: u64,

    #[clap(long, default_value = "3", env("RATEMESH_BREAKER_MAX_REQUESTS"))]
    pub breaker_max_requests: u64,
}

impl Cli {
    pub fn into_settings(self) -> Result<settings::Settings> {
        let node_name = self
            .node_name
            .map(NodeName::from)
            .unwrap_or_else(|| NodeName::from_rpc_address(&self.listen_address, self.listen_port_tcp));
        let settings = settings::Settings {
            node_name,
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            listen_port_tcp: self.listen_port_tcp,
            topology: self.topology,
            tokens_per_node: self.tokens_per_node,
            counting_policy: self.counting_policy,
            expire_interval: Duration::from_secs(self.expire_interval_secs),
            consistency_interval: Duration::from_secs(self.consistency_interval_secs),
            sync: settings::SyncSettings {
                workers: self.sync_workers,
                queue_capacity: self.sync_queue_capacity,
                backpressure: self.backpressure,
                rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            },
            breaker: settings::BreakerSettings {
                scope: self.breaker_scope,
                trip_threshold: self.breaker_trip_threshold,
                cyclic_period: Duration::from_secs(self.breaker_cyclic_period_secs),
                timeout: Duration::from_secs(self.breaker_timeout_secs),
                max_requests: self.breaker_max_requests,
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}
