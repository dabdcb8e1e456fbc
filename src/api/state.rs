use std::sync::Arc;

use crate::cluster::StaticMembership;
use crate::metrics::AtomicMetrics;
use crate::rpc::server::ServerStats;
use crate::service::RatelimitService;

/// Shared by every handler
#[derive(Clone, Debug)]
pub struct AppState {
    pub service: Arc<RatelimitService>,
    pub membership: Arc<StaticMembership>,
    pub metrics: Arc<AtomicMetrics>,
    pub peer_stats: Arc<ServerStats>,
}
