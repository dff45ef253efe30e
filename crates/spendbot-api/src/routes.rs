//! API routes.

use axum::middleware;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::admin::{list_dead_letters, queue_status};
use crate::handlers::jobs::{cancel_job, create_job, get_job};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging, require_admin};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let job_routes = Router::new()
        .route("/jobs", axum::routing::post(create_job))
        .route("/jobs/:job_id", get(get_job).delete(cancel_job));

    // Queue inspection is only mounted when an admin token is configured.
    let admin_routes = if state.config.admin_token.is_some() {
        Router::new()
            .route("/admin/queue", get(queue_status))
            .route("/admin/dlq", get(list_dead_letters))
            .layer(middleware::from_fn_with_state(state.clone(), require_admin))
    } else {
        Router::new()
    };

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", job_routes.merge(admin_routes))
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}
