//! Session key endpoints and the billing snapshot.

use super::{ApiError, AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

/// Response for GET /api/v1/openrouter/session.
///
/// `key` is the encrypted blob; `hash` lets the client revoke the key
/// early via DELETE; `max_age` is the remaining usable lifetime in
/// seconds.
#[derive(Serialize)]
pub struct SessionKeyResponse {
    pub key: String,
    pub hash: String,
    pub max_age: i64,
}

#[derive(Serialize)]
pub struct ExpenseResponse {
    pub usage: f64,
    pub total: f64,
}

/// GET /api/v1/openrouter/session - reuse an available key or issue one
pub async fn get_session_key(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionKeyResponse>, ApiError> {
    let credential = state.broker.session_key().await.map_err(|e| {
        error!(error = %e, "failed to provide a session key");
        ApiError::KeyUnavailable
    })?;

    let max_age = credential.expires_at - Utc::now().timestamp();
    Ok(Json(SessionKeyResponse {
        key: credential.encrypted_key,
        hash: credential.api_hash,
        max_age,
    }))
}

/// DELETE /api/v1/openrouter/session/{hash} - best-effort early revoke.
///
/// Always 204: a failed revoke is retried by the sweep, not surfaced.
pub async fn delete_session_key(
    State(state): State<Arc<AppState>>,
    Path(api_hash): Path<String>,
) -> StatusCode {
    if let Err(e) = state.broker.release_key(&api_hash).await {
        warn!(hash = %api_hash, error = %e, "best-effort revoke failed, sweep will retry");
    }
    StatusCode::NO_CONTENT
}

/// GET /api/v1/openrouter/expense - upstream usage and credit totals
pub async fn get_expense(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ExpenseResponse>, ApiError> {
    let expense = state.upstream.credits().await.map_err(|e| {
        error!(error = %e, "failed to retrieve the current expense");
        ApiError::ExpenseUnavailable
    })?;

    Ok(Json(ExpenseResponse {
        usage: expense.usage,
        total: expense.total,
    }))
}
