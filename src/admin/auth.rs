//! Bearer token authentication for the admin API.
//!
//! The admin token is separate from whatever authenticates end users of
//! the protected API.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use super::router::AppState;

/// Validates the `Authorization: Bearer <token>` header.
///
/// # Errors
///
/// Returns `StatusCode::UNAUTHORIZED` if the header is absent or the
/// token does not match `expected`.
pub(crate) fn validate_bearer(headers: &HeaderMap, expected: &str) -> Result<(), StatusCode> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided == Some(expected) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// Rejects admin requests without the configured token. A deployment
/// without a token leaves the admin API open.
pub(crate) async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(ref token) = state.token {
        if let Err(status) = validate_bearer(request.headers(), token) {
            warn!(path = %request.uri().path(), "Rejected unauthenticated admin request");
            return (status, Json(json!({"error": "unauthorized"}))).into_response();
        }
    }
    next.run(request).await
}
