//! Authentication and request correlation middleware.

use crate::state::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Constant-time token comparison. Empty expected tokens never match.
fn token_matches(provided: &str, expected: &str) -> bool {
    !expected.is_empty()
        && provided.len() == expected.len()
        && provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Token presented on the proxy surface: `Authorization: Bearer` or the
/// provider-style `x-goog-api-key` header.
fn client_token(request: &Request) -> Option<String> {
    bearer_token(request).or_else(|| {
        request
            .headers()
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
}

/// Only the peer address counts; the Host header is attacker-controlled.
fn is_localhost(request: &Request) -> bool {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().is_loopback())
        .unwrap_or(false)
}

fn unauthorized(detail: &str) -> Response {
    let body = serde_json::json!({
        "success": false,
        "error": detail
    });
    (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
}

/// Admit proxy requests carrying a configured client token.
pub async fn client_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(provided) = client_token(&request) else {
        return unauthorized("Missing Authorization or x-goog-api-key header");
    };

    let admitted = state
        .config
        .allowed_tokens
        .iter()
        .any(|token| token_matches(&provided, token))
        || token_matches(&provided, &state.config.auth_token);

    if admitted {
        next.run(request).await
    } else {
        warn!("Rejected proxy request with invalid token");
        unauthorized("Invalid token")
    }
}

/// Admit admin requests from loopback (when bypass is enabled) or with
/// the admin bearer token.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.localhost_bypass_auth && is_localhost(&request) {
        return next.run(request).await;
    }

    match bearer_token(&request) {
        Some(token) if token_matches(&token, &state.config.auth_token) => {
            next.run(request).await
        }
        _ => {
            warn!("Unauthorized admin request");
            unauthorized("Not authenticated")
        }
    }
}

/// Propagate or generate `x-request-id` for end-to-end correlation.
pub async fn inject_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            format!("rly-{:016x}", rng.gen::<u64>())
        });

    // Store for handler access.
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    // Echo back for end-to-end tracing.
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", val);
    }

    response
}

/// Request correlation ID, extractable from `Request::extensions()`.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);
