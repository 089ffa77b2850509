//! Streaming pass-through proxy to the configured upstream providers.
//!
//! The inbound bearer token never leaves this process: credential-bearing
//! and hop-by-hop headers are stripped and the target's own key is
//! injected. The upstream response body is relayed as it arrives; it is
//! never buffered. Dropping the response (including on client disconnect)
//! drops the underlying upstream connection with it.

use super::{ApiError, AppState};
use crate::config::ProxyTarget;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Inbound headers that must not reach the upstream: connection-scoped
/// (hop-by-hop) plus everything that names the caller or its credentials.
const SKIP_REQUEST_HEADERS: [&str; 11] = [
    "authorization",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "x-forwarded-for",
];

/// Upstream response headers withheld from the caller: connection-scoped
/// plus infrastructure fingerprints.
const SKIP_RESPONSE_HEADERS: [&str; 7] = [
    "connection",
    "transfer-encoding",
    "set-cookie",
    "x-request-id",
    "server",
    "cf-ray",
    "alt-svc",
];

/// ANY /api/v1/{target}/{*path} - forward to the named provider
pub async fn forward(
    State(state): State<Arc<AppState>>,
    Path((target_name, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let target = state
        .targets
        .get(&target_name)
        .ok_or(ApiError::UnknownTarget)?;

    let query = request
        .uri()
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let url = format!("{}/{}{}", target.base_url, path, query);

    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|_| ApiError::UpstreamUnavailable)?;
    let carries_body = matches!(
        method,
        reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH
    );

    let mut outbound = state
        .http
        .request(method, &url)
        .bearer_auth(credential_for(target, &path));
    for (name, value) in request.headers() {
        if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            outbound = outbound.header(name.as_str(), value);
        }
    }

    if carries_body {
        let body = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| {
                warn!(target = %target_name, error = %e, "failed to read request body");
                ApiError::UpstreamUnavailable
            })?;
        outbound = outbound.body(body);
    }

    debug!(target = %target_name, path = %path, "forwarding request");
    // Not retried: the request may not be idempotent (e.g. a billable
    // generation call). Retry policy belongs to the caller.
    let upstream_response = outbound.send().await.map_err(|e| {
        warn!(target = %target_name, path = %path, error = %e, "proxy request failed");
        ApiError::UpstreamUnavailable
    })?;

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .map_err(|_| ApiError::UpstreamUnavailable)?;

    let mut headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if SKIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream_response.bytes_stream()))
        .map_err(|_| ApiError::UpstreamUnavailable)?;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Admin-prefixed paths use the target's admin credential when one is
/// configured; everything else gets the regular key.
fn credential_for<'a>(target: &'a ProxyTarget, path: &str) -> &'a str {
    let first_segment = path.split('/').next().unwrap_or_default();
    match (&target.admin_prefix, &target.admin_api_key) {
        (Some(prefix), Some(admin_key)) if prefix == first_segment => admin_key,
        _ => &target.api_key,
    }
}
