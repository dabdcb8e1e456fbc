use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use super::state::AppState;
use crate::error::RatemeshError;
use crate::limiters::{RatelimitRequest, RatelimitResponse};

/// Rejected requests still get the full decision body, with a 429
#[instrument(skip(state), level = "debug")]
pub async fn rate_limit(
    State(state): State<AppState>,
    Json(request): Json<RatelimitRequest>,
) -> Result<(StatusCode, Json<RatelimitResponse>), RatemeshError> {
    let response = state.service.ratelimit(request).await.map_err(|err| {
        event!(
            Level::ERROR,
            message = "Failed limiting request",
            err = format!("{:?}", err)
        );
        err
    })?;
    let status = if response.pass {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    Ok((status, Json(response)))
}

#[instrument(skip_all, level = "debug")]
pub async fn multi_rate_limit(
    State(state): State<AppState>,
    Json(requests): Json<Vec<RatelimitRequest>>,
) -> Result<Json<Vec<RatelimitResponse>>, RatemeshError> {
    state.service.multi_ratelimit(requests).await.map(Json)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExpireResponse {
    pub buckets_removed: usize,
    pub buckets_remaining: usize,
}

#[instrument(skip(state), level = "debug")]
pub async fn expire_keys(State(state): State<AppState>) -> Json<ExpireResponse> {
    let buckets_removed = state.service.expire_keys();
    Json(ExpireResponse {
        buckets_removed,
        buckets_remaining: state.service.limiter().len(),
    })
}
