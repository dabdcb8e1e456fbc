use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::state::AppState;
use crate::cluster::Membership;
use crate::error::RatemeshError;
use crate::hashring::{Node, NodeName};

#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub node_id: String,
    pub members: Vec<Node>,
    pub ring_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: String,
    pub rpc_address: String,
}

#[instrument(skip(state), level = "debug")]
pub async fn list_members(State(state): State<AppState>) -> Json<MembersResponse> {
    Json(MembersResponse {
        node_id: state.membership.node_id().to_string(),
        members: state.membership.members(),
        ring_size: state.service.ring().len(),
    })
}

#[instrument(skip(state))]
pub async fn join_member(
    State(state): State<AppState>,
    Json(request): Json<JoinRequest>,
) -> Result<(StatusCode, Json<Node>), RatemeshError> {
    let node = Node::new(NodeName::from(request.id), request.rpc_address);
    state.membership.join(node.clone())?;
    info!("Operator added {} at {}", node.id, node.rpc_address);
    Ok((StatusCode::CREATED, Json(node)))
}

#[instrument(skip(state))]
pub async fn leave_member(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Node>, RatemeshError> {
    let node = state.membership.leave(&NodeName::from(node_id))?;
    info!("Operator removed {}", node.id);
    Ok(Json(node))
}
