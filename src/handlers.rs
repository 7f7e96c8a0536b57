//! HTTP request handlers.

use crate::dispatch::Dispatcher;
use crate::metrics::METRICS;
use crate::middleware::RequestId;
use crate::observability::ErrorSummary;
use crate::response::{HealthResponse, KeysStatusResponse, PoolStats, RpmStatusResponse};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{FromRequest, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const ERROR_LOG_DEFAULT_LIMIT: usize = 50;
const ERROR_LOG_MAX_LIMIT: usize = 500;

// --- Proxy surface ---

/// `POST /v1beta/models/{model}:{action}` against the primary pool.
pub async fn models_api(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    request: axum::extract::Request,
) -> Response {
    let dispatcher = state.api_dispatcher.clone();
    proxy_call(state, dispatcher, model_action, request).await
}

/// Same surface against the auxiliary pool.
pub async fn models_vertex(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    request: axum::extract::Request,
) -> Response {
    let dispatcher = state.vertex_dispatcher.clone();
    proxy_call(state, dispatcher, model_action, request).await
}

async fn proxy_call(
    state: Arc<AppState>,
    dispatcher: Dispatcher,
    model_action: String,
    request: axum::extract::Request,
) -> Response {
    let start = Instant::now();
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);
    state.request_count.fetch_add(1, Ordering::Relaxed);

    // Correlation ID (set by middleware).
    let req_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let Some((model, action)) = parse_model_action(&model_action) else {
        METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "Expected {model}:{action}"})),
        )
            .into_response();
    };
    let model = model.to_string();
    let action = action.to_string();

    let payload: Value = match axum::Json::<Value>::from_request(request, &state).await {
        Ok(axum::Json(value)) => value,
        Err(e) => {
            METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
            warn!(req_id = %req_id, error = %e, "Invalid JSON body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": "Invalid JSON body"})),
            )
                .into_response();
        }
    };

    info!(req_id = %req_id, model = %model, action = %action, "Relaying request");

    match action.as_str() {
        "generateContent" => {
            let cancel = CancellationToken::new();
            match dispatcher.generate(&model, &payload, &cancel).await {
                Ok(response) => {
                    METRICS.requests_success.fetch_add(1, Ordering::Relaxed);
                    METRICS.record_request_duration(start);
                    Json(response).into_response()
                }
                Err(err) => {
                    METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
                    METRICS.record_request_duration(start);
                    error!(req_id = %req_id, error = %err, "Generate failed");
                    err.into_response()
                }
            }
        }
        "countTokens" => {
            let cancel = CancellationToken::new();
            match dispatcher.count_tokens(&model, &payload, &cancel).await {
                Ok(response) => {
                    METRICS.requests_success.fetch_add(1, Ordering::Relaxed);
                    METRICS.record_request_duration(start);
                    Json(response).into_response()
                }
                Err(err) => {
                    METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
                    METRICS.record_request_duration(start);
                    error!(req_id = %req_id, error = %err, "Count tokens failed");
                    err.into_response()
                }
            }
        }
        "streamGenerateContent" => {
            // Failures after the stream opens travel as SSE error frames;
            // the 200 status is already on the wire by then.
            let frames = dispatcher.stream_generate(&model, payload).map(|item| {
                let frame = match item {
                    Ok(event) => format!("data: {event}\n\n"),
                    Err(err) => {
                        METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
                        let code = err.status_code().as_u16();
                        format!(
                            "data: {}\n\n",
                            json!({"error": {"code": code, "message": err.to_string()}})
                        )
                    }
                };
                Ok::<_, std::convert::Infallible>(Bytes::from(frame))
            });
            (
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(frames),
            )
                .into_response()
        }
        _ => {
            METRICS.requests_error.fetch_add(1, Ordering::Relaxed);
            (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": format!("Unsupported action: {action}")})),
            )
                .into_response()
        }
    }
}

/// Split the provider-style `<model>:<action>` path segment.
fn parse_model_action(segment: &str) -> Option<(&str, &str)> {
    let (model, action) = segment.rsplit_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some((model, action))
}

// --- Admin surface ---

#[derive(Deserialize)]
pub struct RpmStatusQuery {
    pub model: Option<String>,
}

/// `GET /api/rpm-status?model=M`
pub async fn rpm_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RpmStatusQuery>,
) -> Json<RpmStatusResponse> {
    let api = state.api_pool.snapshot();
    let vertex = state.vertex_pool.snapshot();
    Json(RpmStatusResponse {
        api_keys: api.keys,
        vertex_keys: vertex.keys,
        current_model: api.current_model,
        rpm_window_seconds: state.config.rpm_window_seconds,
        rpm_prefer_cache: state.config.rpm_prefer_cache,
        rpm_limits: state
            .config
            .rpm_limits
            .iter()
            .map(|(model, limit)| (model.clone(), *limit))
            .collect(),
        model_rpm_limit: query
            .model
            .as_deref()
            .map(|model| state.api_pool.limit_for(model)),
    })
}

/// `GET /api/key-usage-details/{key}`: per-model calls over 24 hours.
pub async fn key_usage_details(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<BTreeMap<String, u64>> {
    Json(state.log.key_usage_last_24h(&key))
}

/// `GET /api/keys/status`: valid/invalid partition for both pools.
pub async fn keys_status(State(state): State<Arc<AppState>>) -> Json<KeysStatusResponse> {
    Json(KeysStatusResponse {
        api_keys: state.api_pool.classify(),
        vertex_keys: state.vertex_pool.classify(),
    })
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolName {
    #[default]
    Api,
    Vertex,
}

#[derive(Deserialize)]
pub struct ResetFailuresRequest {
    #[serde(default)]
    pub pool: PoolName,
    #[serde(default)]
    pub key: Option<String>,
}

/// `POST /api/keys/reset-failures`
pub async fn reset_failures(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetFailuresRequest>,
) -> Response {
    let pool = match request.pool {
        PoolName::Api => &state.api_pool,
        PoolName::Vertex => &state.vertex_pool,
    };
    if pool.reset_failures(request.key.as_deref()) {
        Json(json!({"success": true})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "Unknown key"})),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
pub struct ErrorLogQuery {
    pub limit: Option<usize>,
}

/// `GET /api/logs/errors?limit=N`: newest errors, keys redacted.
pub async fn error_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ErrorLogQuery>,
) -> Json<Vec<ErrorSummary>> {
    let limit = query
        .limit
        .unwrap_or(ERROR_LOG_DEFAULT_LIMIT)
        .min(ERROR_LOG_MAX_LIMIT);
    Json(state.log.recent_errors(limit))
}

// --- Operations ---

/// Readiness probe. Returns 200 once a pool has a usable key.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Lazily flip ready once a pool is healthy.
    if !state.ready.load(Ordering::Relaxed)
        && (state.api_pool.valid_count() > 0 || state.vertex_pool.valid_count() > 0)
    {
        state.ready.store(true, Ordering::Relaxed);
    }

    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Health check with per-pool key stats.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let api_valid = state.api_pool.valid_count();
    let vertex_valid = state.vertex_pool.valid_count();

    let status = if api_valid + vertex_valid == 0 {
        "unavailable"
    } else if (state.api_pool.key_count() > 0 && api_valid == 0)
        || (state.vertex_pool.key_count() > 0 && vertex_valid == 0)
    {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        uptime_secs: state.start_time.elapsed().as_secs(),
        requests: state.request_count.load(Ordering::Relaxed),
        api_pool: PoolStats {
            total_keys: state.api_pool.key_count(),
            valid_keys: api_valid,
            current_model: state.api_pool.snapshot().current_model,
        },
        vertex_pool: PoolStats {
            total_keys: state.vertex_pool.key_count(),
            valid_keys: vertex_valid,
            current_model: state.vertex_pool.snapshot().current_model,
        },
    })
}

/// Prometheus metrics in text exposition format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = METRICS.render(
        state.api_pool.valid_count(),
        state.api_pool.key_count(),
        state.vertex_pool.valid_count(),
        state.vertex_pool.key_count(),
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_action_splits_on_last_colon() {
        assert_eq!(
            parse_model_action("gemini-2.5-flash:generateContent"),
            Some(("gemini-2.5-flash", "generateContent"))
        );
        // Model ids may themselves contain colons in tuned variants.
        assert_eq!(
            parse_model_action("tunedModels/x:y:countTokens"),
            Some(("tunedModels/x:y", "countTokens"))
        );
    }

    #[test]
    fn test_parse_model_action_rejects_malformed_segments() {
        assert_eq!(parse_model_action("gemini-2.5-flash"), None);
        assert_eq!(parse_model_action(":generateContent"), None);
        assert_eq!(parse_model_action("gemini-2.5-flash:"), None);
    }
}
