//! Axum router for the admin API.
//!
//! Routes (all under `/admin`, bearer token required when configured):
//! `GET /status`, `GET /status/:identity`, `GET /abusers`,
//! `POST /reset/:identity`, `PUT /configure`, `POST /reload`.
//! `GET /health` is unauthenticated.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::auth;
use super::service::{AdminService, ConfigUpdate, DEFAULT_TOP_CONSUMERS};
use crate::error::TollboothError;
use crate::ratelimit::{Identity, Role, TimeWindow};

/// Abusers listed when the request does not say how many.
const DEFAULT_ABUSER_COUNT: usize = 10;

/// Shared state threaded through all axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The admin operations.
    pub admin: Arc<AdminService>,
    /// Optional Bearer token (None = no authentication required).
    pub token: Option<String>,
}

/// Builds the axum `Router` with all admin routes.
pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/status", get(handle_global_status))
        .route("/status/:identity", get(handle_identity_status))
        .route("/abusers", get(handle_abusers))
        .route("/reset/:identity", post(handle_reset))
        .route("/configure", put(handle_configure))
        .route("/reload", post(handle_reload))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .nest("/admin", admin)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    top: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct IdentityQuery {
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AbusersQuery {
    window: Option<String>,
    limit: Option<usize>,
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "tollbooth"}))
}

async fn handle_global_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Response {
    match state
        .admin
        .global_status(query.top.unwrap_or(DEFAULT_TOP_CONSUMERS))
        .await
    {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_identity_status(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(query): Query<IdentityQuery>,
) -> Response {
    let Some(identity) = Identity::parse(&identity) else {
        return bad_request("invalid identity");
    };
    let role = Role::resolve(query.role.as_deref());

    match state.admin.identity_status(&identity, &role).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_abusers(
    State(state): State<AppState>,
    Query(query): Query<AbusersQuery>,
) -> Response {
    let window = match query.window.as_deref() {
        None => TimeWindow::Minute,
        Some(raw) => match raw.parse::<TimeWindow>() {
            Ok(window) => window,
            Err(_) => return bad_request(&format!("unknown window '{}'", raw)),
        },
    };
    let limit = query.limit.unwrap_or(DEFAULT_ABUSER_COUNT);

    match state.admin.list_abusers(window, limit).await {
        Ok(abusers) => Json(json!({"window": window, "abusers": abusers})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_reset(State(state): State<AppState>, Path(identity): Path<String>) -> Response {
    let Some(identity) = Identity::parse(&identity) else {
        return bad_request("invalid identity");
    };

    match state.admin.reset_identity(&identity).await {
        Ok(deleted) => {
            Json(json!({"identity": identity.to_string(), "deleted": deleted})).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_configure(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Response {
    match state.admin.update_configuration(&update).await {
        Ok(version) => Json(json!({"version": version})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_reload(State(state): State<AppState>) -> Response {
    match state.admin.reload_configuration().await {
        Ok(version) => Json(json!({"version": version})).into_response(),
        Err(e) => error_response(e),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

/// Maps service errors to HTTP status codes.
fn error_response(err: TollboothError) -> Response {
    let status = match &err {
        TollboothError::ConfigurationInvalid(_) | TollboothError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        e if e.is_store_failure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status != StatusCode::BAD_REQUEST {
        error!(error = %err, "Admin request failed");
    }
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
