//! Request pipeline stage that enforces rate limits.
//!
//! Mount in front of protected routes with
//! `axum::middleware::from_fn_with_state(limiter, enforce_rate_limit)`.
//! Identity and role are read from headers set by the authentication layer
//! in front of this stage; missing values fall back to the client address
//! and the anonymous role.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::ratelimit::{RateLimitResult, RateLimiter};

/// Authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Authenticated user role.
pub const USER_ROLE_HEADER: &str = "x-user-role";
/// Tokens this request costs (default 1).
pub const REQUEST_COST_HEADER: &str = "x-request-cost";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Check the request against every applicable limit before running the
/// handler. Denied requests get `429` with the denial body; both paths
/// carry the rate limit headers.
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let user_id = header_str(headers, USER_ID_HEADER).map(str::to_string);
    let role = header_str(headers, USER_ROLE_HEADER).map(str::to_string);
    let cost = header_str(headers, REQUEST_COST_HEADER)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(1);
    let addr = client_addr(&request);
    let endpoint = request.uri().path().to_string();

    let result = limiter
        .check_unresolved(user_id.as_deref(), role.as_deref(), addr, &endpoint, cost)
        .await;

    let mut response = match result.denial() {
        Some(denial) => (StatusCode::TOO_MANY_REQUESTS, Json(denial)).into_response(),
        None => next.run(request).await,
    };
    apply_headers(response.headers_mut(), &result);
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Client address: first `X-Forwarded-For` hop, else the socket peer.
fn client_addr(request: &Request) -> Option<IpAddr> {
    let forwarded = header_str(request.headers(), FORWARDED_FOR_HEADER)
        .and_then(|raw| raw.split(',').next())
        .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

fn apply_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    for (name, value) in result.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    use crate::ratelimit::{
        ConfigHandle, FailurePolicy, LimitRules, LimitTarget, Role, TimeWindow, TokenBucketEngine,
    };
    use crate::store::{ManualClock, MemoryStore};

    fn app(rules: LimitRules) -> Router {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(ManualClock::new(0.0))));
        let engine = TokenBucketEngine::new(store, FailurePolicy::Closed);
        let config = Arc::new(ConfigHandle::new(rules).unwrap());
        let limiter = Arc::new(RateLimiter::new(config, engine));

        Router::new()
            .route("/api/items", get(|| async { "items" }))
            .layer(axum::middleware::from_fn_with_state(
                limiter,
                enforce_rate_limit,
            ))
    }

    fn rules() -> LimitRules {
        let mut rules = LimitRules::new();
        rules.burst_multiplier = 1.0;
        rules.set_limit(&LimitTarget::Role(Role::Viewer), TimeWindow::Minute, 2, None);
        rules.set_limit(&LimitTarget::Role(Role::Anonymous), TimeWindow::Minute, 1, None);
        rules
    }

    fn request(user: Option<&str>, role: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().uri("/api/items");
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        if let Some(role) = role {
            builder = builder.header(USER_ROLE_HEADER, role);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn allowed_request_reaches_handler_with_headers() {
        let app = app(rules());
        let resp = app
            .oneshot(request(Some("alice"), Some("viewer")))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-ratelimit-limit"], "2");
        assert_eq!(resp.headers()["x-ratelimit-remaining"], "1");
        assert!(resp.headers().get("retry-after").is_none());
    }

    #[tokio::test]
    async fn denied_request_gets_429_body() {
        let app = app(rules());
        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(request(Some("alice"), Some("viewer")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app
            .oneshot(request(Some("alice"), Some("viewer")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "30");

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let denial: crate::ratelimit::RateLimitDenial = serde_json::from_slice(&body).unwrap();
        assert_eq!(denial.error_kind, "rate_limit_exceeded");
        assert_eq!(denial.limit, Some(2));
        assert_eq!(denial.retry_after, 30);
    }

    #[tokio::test]
    async fn forwarded_address_identifies_anonymous_callers() {
        let app = app(rules());
        let from = |ip: &str| {
            HttpRequest::builder()
                .uri("/api/items")
                .header(FORWARDED_FOR_HEADER, format!("{}, 10.0.0.1", ip))
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(from("203.0.113.7")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(from("203.0.113.7")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let other = app.oneshot(from("203.0.113.8")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_cost_header_is_honoured() {
        let app = app(rules());
        let resp = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/items")
                    .header(USER_ID_HEADER, "bob")
                    .header(USER_ROLE_HEADER, "viewer")
                    .header(REQUEST_COST_HEADER, "3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
