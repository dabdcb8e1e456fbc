mod base;
mod cluster;
mod rate_limits;

use std::borrow::Cow;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;
pub mod state;

pub use base::{AboutResponse, MetricsResponse};
pub use cluster::{JoinRequest, MembersResponse};
pub use rate_limits::ExpireResponse;
pub use state::AppState;

/// Client and operator HTTP API
pub fn api(state: AppState) -> Router {
    Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        .route(paths::base::METRICS, routing::get(base::metrics))
        .route(paths::rate_limits::LIMIT, routing::post(rate_limits::rate_limit))
        .route(
            paths::rate_limits::MULTI_LIMIT,
            routing::post(rate_limits::multi_rate_limit),
        )
        .route(paths::EXPIRE_KEYS, routing::post(rate_limits::expire_keys))
        .route(
            paths::cluster::MEMBERS,
            routing::get(cluster::list_members).post(cluster::join_member),
        )
        .route(paths::cluster::MEMBER, routing::delete(cluster::leave_member))
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(Duration::from_secs(10)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
