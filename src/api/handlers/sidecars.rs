use std::time::Duration;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState, DrainRequest, SidecarStatusResponse};
use crate::types::ServiceMetrics;

/// `POST /services/:id/sidecar`
pub async fn inject_sidecar(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<ApiResponse<SidecarStatusResponse>>)> {
    state.manager.inject_sidecar(&id).await?;
    let status = state.manager.sidecar_status(&id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(SidecarStatusResponse { service_id: id, status })),
    ))
}

/// `GET /services/:id/sidecar`
pub async fn sidecar_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<SidecarStatusResponse>>> {
    let status = state.manager.sidecar_status(&id).await?;
    Ok(Json(ApiResponse::success(SidecarStatusResponse { service_id: id, status })))
}

/// `DELETE /services/:id/sidecar`
pub async fn remove_sidecar(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<bool>>> {
    state.manager.remove_sidecar(&id).await?;
    Ok(Json(ApiResponse::success(true)))
}

/// `GET /services/:id/sidecar/metrics`
pub async fn sidecar_metrics(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<ServiceMetrics>>> {
    let metrics = state.manager.get_metrics(&id).await?;
    Ok(Json(ApiResponse::success(metrics)))
}

/// `GET /services/:id/sidecar/config_dump`
pub async fn config_dump(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<serde_json::Value>>> {
    let dump = state.manager.config_dump(&id).await?;
    Ok(Json(ApiResponse::success(dump)))
}

/// `POST /services/:id/sidecar/drain`
pub async fn drain_sidecar(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<DrainRequest>,
) -> ApiResult<Json<ApiResponse<bool>>> {
    state
        .manager
        .drain_sidecar(&id, Duration::from_millis(request.timeout_ms))
        .await?;
    Ok(Json(ApiResponse::success(true)))
}
