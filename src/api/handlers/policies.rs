use axum::{
    extract::{Path, State},
    Json,
};

use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState};
use crate::policy::TrafficPolicy;

/// `POST /services/:id/policies`
pub async fn apply_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(policy): Json<TrafficPolicy>,
) -> ApiResult<Json<ApiResponse<TrafficPolicy>>> {
    state.manager.apply_policy(&id, policy.clone()).await?;
    Ok(Json(ApiResponse::success(policy)))
}

/// `GET /services/:id/policies`
pub async fn list_policies(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Vec<TrafficPolicy>>>> {
    let policies = state.manager.list_policies(&id).await?;
    Ok(Json(ApiResponse::success(policies)))
}

/// `GET /services/:id/policies/:name`
pub async fn get_policy(
    State(state): State<ApiState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<TrafficPolicy>>> {
    let policy = state.manager.get_policy(&id, &name).await?;
    Ok(Json(ApiResponse::success(policy)))
}

/// `DELETE /services/:id/policies/:name`
pub async fn remove_policy(
    State(state): State<ApiState>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Json<ApiResponse<bool>>> {
    state.manager.remove_policy(&id, &name).await?;
    Ok(Json(ApiResponse::success(true)))
}
