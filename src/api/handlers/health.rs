use axum::{extract::State, Json};
use tracing::debug;

use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState, HealthResponse};

/// Health check handler
///
/// # Route
///
/// `GET /health`
pub async fn health_check(
    State(state): State<ApiState>,
) -> ApiResult<Json<ApiResponse<HealthResponse>>> {
    debug!("Health check requested");

    let health = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.started_at.elapsed().as_secs(),
        services: state.manager.list_services().await.len(),
    };

    Ok(Json(ApiResponse::success(health)))
}
