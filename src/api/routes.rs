use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::api::types::ApiState;
use crate::api::handlers::{
    health::health_check,
    metrics::get_metrics,
    policies::{apply_policy, get_policy, list_policies, remove_policy},
    services::{enable_mtls, get_service, list_services, register_service, unregister_service},
    sidecars::{
        config_dump, drain_sidecar, inject_sidecar, remove_sidecar, sidecar_metrics,
        sidecar_status,
    },
};

/// Create router with all API routes
///
/// `/health` and `/metrics` are served at the root; everything else is
/// nested under `prefix`.
pub fn create_router(state: ApiState, prefix: &str) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics));

    let service_routes = Router::new()
        .route("/services", post(register_service).get(list_services))
        .route("/services/:id", get(get_service).delete(unregister_service))
        .route(
            "/services/:id/sidecar",
            post(inject_sidecar).get(sidecar_status).delete(remove_sidecar),
        )
        .route("/services/:id/sidecar/metrics", get(sidecar_metrics))
        .route("/services/:id/sidecar/config_dump", get(config_dump))
        .route("/services/:id/sidecar/drain", post(drain_sidecar))
        .route("/services/:id/policies", post(apply_policy).get(list_policies))
        .route(
            "/services/:id/policies/:name",
            get(get_policy).delete(remove_policy),
        )
        .route("/services/:id/mtls", post(enable_mtls));

    let prefix = prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        public_routes.merge(service_routes)
    } else {
        public_routes.nest(prefix, service_routes)
    };

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
