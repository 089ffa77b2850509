//! Bearer-token gate in front of every route.
//!
//! Exempt: CORS preflight, the liveness probe, and favicon fetches.
//! The `auth.disabled` flag trusts everything (development only).

use super::{ApiError, AppState};
use crate::trust::{bearer_token, AuthFailure};
use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::error;

pub async fn verify_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.auth_disabled || is_exempt(request.method(), request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let token = bearer_token(request.headers()).map_err(|failure| match failure {
        AuthFailure::Missing => ApiError::MissingToken,
        AuthFailure::Invalid => ApiError::InvalidToken,
    })?;

    match state.verifier.verify(&token).await {
        Ok(true) => Ok(next.run(request).await),
        Ok(false) => Err(ApiError::InvalidToken),
        Err(e) => {
            error!(error = %e, "token verification unavailable");
            Err(ApiError::AuthUnavailable)
        }
    }
}

fn is_exempt(method: &Method, path: &str) -> bool {
    if method == Method::OPTIONS {
        return true;
    }
    method == Method::GET && matches!(path, "/api/v1/health" | "/favicon.ico")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exemptions() {
        assert!(is_exempt(&Method::OPTIONS, "/api/v1/openrouter/session"));
        assert!(is_exempt(&Method::GET, "/api/v1/health"));
        assert!(is_exempt(&Method::GET, "/favicon.ico"));

        assert!(!is_exempt(&Method::GET, "/api/v1/openrouter/session"));
        assert!(!is_exempt(&Method::POST, "/api/v1/health"));
        assert!(!is_exempt(&Method::GET, "/api/v1/openrouter/expense"));
    }
}
