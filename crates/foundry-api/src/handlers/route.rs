//! Router endpoint — tells a client which build agent to use.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::RouterState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct EndpointResponse {
    pub endpoint: String,
}

pub async fn handle_route(State(state): State<RouterState>) -> Result<Json<EndpointResponse>, ApiError> {
    let agent = state.router.route().await?;
    Ok(Json(EndpointResponse {
        endpoint: agent.endpoint_or(state.default_worker_port),
    }))
}
