use axum::extract::State;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::state::AppState;
use crate::metrics::MetricsSnapshot;
use crate::rpc::server::FrozenServerStats;
use crate::settings::{APP_NAME, APP_VERSION};

// basic handler that responds with a static string
pub async fn root() -> &'static str {
    "Welcome to Ratemesh"
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AboutResponse {
    pub name: String,
    pub version: String,
    pub node_id: String,
}

#[instrument(skip(state))]
pub async fn about(State(state): State<AppState>) -> axum::Json<AboutResponse> {
    axum::Json(AboutResponse {
        name: APP_NAME.to_string(),
        version: APP_VERSION.to_string(),
        node_id: state.service.node_id().to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub service: MetricsSnapshot,
    pub peer_rpc: FrozenServerStats,
}

#[instrument(skip(state), level = "debug")]
pub async fn metrics(State(state): State<AppState>) -> axum::Json<MetricsResponse> {
    axum::Json(MetricsResponse {
        service: state.metrics.snapshot(),
        peer_rpc: state.peer_stats.freeze(),
    })
}
