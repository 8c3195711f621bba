use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
};

use crate::api::errors::ApiResult;
use crate::api::types::ApiState;

/// Prometheus exposition of the control plane metrics
pub async fn get_metrics(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let body = state.manager.metrics().render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
