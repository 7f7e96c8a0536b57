//! HTTP router and middleware stack.

use crate::handlers;
use crate::middleware::{admin_auth, client_auth, inject_request_id};
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_SIZE: usize = 8 * 1024 * 1024; // 8 MB: inline media parts are large
const MAX_CONCURRENT_PROXY: usize = 256;

pub fn create(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let proxy_routes = Router::new()
        .route("/v1beta/models/{model_action}", post(handlers::models_api))
        .route(
            "/vertex/v1beta/models/{model_action}",
            post(handlers::models_vertex),
        )
        .layer(middleware::from_fn_with_state(state.clone(), client_auth))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_PROXY));

    let admin_routes = Router::new()
        .route("/api/rpm-status", get(handlers::rpm_status))
        .route(
            "/api/key-usage-details/{key}",
            get(handlers::key_usage_details),
        )
        .route("/api/keys/status", get(handlers::keys_status))
        .route("/api/keys/reset-failures", post(handlers::reset_failures))
        .route("/api/logs/errors", get(handlers::error_logs))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics));

    let request_timeout = Duration::from_secs(state.config.request_timeout_secs);

    public_routes
        .merge(proxy_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn(inject_request_id))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
