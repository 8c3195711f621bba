use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::api::errors::ApiResult;
use crate::api::types::{ApiResponse, ApiState};
use crate::ca::Certificate;
use crate::mesh::Service;

/// `POST /services`
pub async fn register_service(
    State(state): State<ApiState>,
    Json(service): Json<Service>,
) -> ApiResult<(StatusCode, Json<ApiResponse<Service>>)> {
    let service = state.manager.register_service(service).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(service))))
}

/// `GET /services`
pub async fn list_services(State(state): State<ApiState>) -> Json<ApiResponse<Vec<Service>>> {
    Json(ApiResponse::success(state.manager.list_services().await))
}

/// `GET /services/:id`
pub async fn get_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Service>>> {
    let service = state.manager.get_service(&id).await?;
    Ok(Json(ApiResponse::success(service)))
}

/// `DELETE /services/:id`
pub async fn unregister_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<bool>>> {
    state.manager.unregister_service(&id).await?;
    Ok(Json(ApiResponse::success(true)))
}

/// `POST /services/:id/mtls`
pub async fn enable_mtls(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Certificate>>> {
    let cert = state.manager.enable_mtls(&id).await?;
    Ok(Json(ApiResponse::success(cert)))
}
