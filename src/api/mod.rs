//! HTTP surface: session key endpoints, billing snapshot, streaming
//! provider proxy, and the bearer-token middleware in front of them.
//!
//! Callers get generic failure messages; the detailed outcome (hash,
//! path, upstream error) only goes to the logs.

pub mod auth_middleware;
pub mod proxy;
pub mod session;

use crate::broker::SessionKeyBroker;
use crate::config::{CorsConfig, ProxyTarget};
use crate::trust::TokenVerifier;
use crate::upstream::ProvisioningClient;
use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{any, delete, get},
    Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SessionKeyBroker>,
    pub verifier: Arc<TokenVerifier>,
    pub upstream: Arc<ProvisioningClient>,
    pub targets: Arc<HashMap<String, ProxyTarget>>,
    pub http: reqwest::Client,
    pub auth_disabled: bool,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Request-boundary failures, mapped to generic client responses.
#[derive(Debug, PartialEq)]
pub enum ApiError {
    /// No bearer token on a guarded route
    MissingToken,
    /// Token present but unverifiable
    InvalidToken,
    /// Key set could not be fetched; verification impossible
    AuthUnavailable,
    /// Session key could not be issued or served
    KeyUnavailable,
    /// Billing snapshot could not be retrieved
    ExpenseUnavailable,
    /// No proxy target configured under that name
    UnknownTarget,
    /// Proxied request failed to reach the upstream
    UpstreamUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingToken => (StatusCode::UNAUTHORIZED, "missing token"),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "invalid token"),
            ApiError::AuthUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "token validation failed unexpectedly",
            ),
            ApiError::KeyUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to retrieve the API key",
            ),
            ApiError::ExpenseUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to retrieve the current expense",
            ),
            ApiError::UnknownTarget => (StatusCode::NOT_FOUND, "unknown provider"),
            ApiError::UpstreamUnavailable => (StatusCode::BAD_GATEWAY, "upstream request failed"),
        };
        let body = Json(ErrorResponse {
            error: message.to_string(),
        });
        (status, body).into_response()
    }
}

/// GET /api/v1/health - liveness probe, exempt from auth
async fn health() -> &'static str {
    "ok"
}

/// Create the API router with all endpoints, auth middleware, and CORS.
pub fn create_router(state: AppState, cors: &CorsConfig) -> Router {
    let state = Arc::new(state);

    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors_layer = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/openrouter/session", get(session::get_session_key))
        .route(
            "/api/v1/openrouter/session/:api_hash",
            delete(session::delete_session_key),
        )
        .route("/api/v1/openrouter/expense", get(session::get_expense))
        .route("/api/v1/:target/*path", any(proxy::forward))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware::verify_token,
        ))
        .layer(cors_layer)
        .with_state(state)
}
