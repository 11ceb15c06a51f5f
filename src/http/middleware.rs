//! Axum middleware running the admission guard in front of handlers.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/rate-limited", get(handler))
//!     .route_layer(axum::middleware::from_fn_with_state(guard, enforce_rate_limit));
//! ```
//!
//! The client IP comes from [`ConnectInfo`], so the router must be served
//! with `into_make_service_with_connect_info::<SocketAddr>()`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use crate::guard::{AdmissionGuard, AdmissionRequest, RejectionBody, ResponseHeaders, Verdict};

/// Admit the request or answer `429 Too Many Requests`.
pub async fn enforce_rate_limit(
    State(guard): State<Arc<AdmissionGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let verdict = {
        let admission =
            AdmissionRequest::new(&route, ip.as_deref()).with_headers(request.headers());
        guard.check(&admission).await
    };

    match verdict {
        Ok(Verdict::Admitted { headers, .. }) => {
            let mut response = next.run(request).await;
            write_headers(response.headers_mut(), &headers);
            response
        }
        Ok(Verdict::Rejected(rejection)) => {
            let mut response = match rejection.body {
                RejectionBody::Message(message) => {
                    (StatusCode::TOO_MANY_REQUESTS, message).into_response()
                }
                RejectionBody::Json(body) => {
                    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
                }
            };
            write_headers(response.headers_mut(), &rejection.headers);
            response
        }
        Err(e) => {
            error!(route = %route, error = %e, "Rate limiter misconfigured");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn write_headers(target: &mut HeaderMap, headers: &ResponseHeaders) {
    for (name, value) in headers.iter() {
        match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!(header = %name, value = %value, "Skipping invalid response header"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{
        RouteConfig, RETRY_AFTER, X_RATELIMIT_LIMIT, X_RETRY_REMAINING, X_RETRY_RESET,
    };
    use crate::ratelimit::RateLimiterOptions;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn router(guard: AdmissionGuard) -> Router {
        Router::new()
            .route("/unrestricted", get(|| async { "Hello World!" }))
            .route("/rate-limited", get(|| async { "Hello World!" }))
            .route("/items/{id}", get(|| async { "item" }))
            .route_layer(axum::middleware::from_fn_with_state(
                Arc::new(guard),
                enforce_rate_limit,
            ))
    }

    fn request(path: &str, ip: [u8; 4]) -> Request {
        let mut request = axum::http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        request
    }

    fn guard() -> AdmissionGuard {
        AdmissionGuard::builder()
            .route("/unrestricted", RouteConfig::skipped())
            .route(
                "/rate-limited",
                RouteConfig::limited(RateLimiterOptions {
                    points: Some(2),
                    duration: Some(120),
                    ..Default::default()
                }),
            )
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_response_carries_headers() {
        let app = router(guard());

        let response = app.oneshot(request("/rate-limited", [10, 0, 0, 1])).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[RETRY_AFTER], "120");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "2");
        assert_eq!(headers[X_RETRY_REMAINING], "1");
        assert!(headers.contains_key(X_RETRY_RESET));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_response_is_429() {
        let app = router(guard());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request("/rate-limited", [10, 0, 0, 2]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .clone()
            .oneshot(request("/rate-limited", [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "120");
        assert!(!response.headers().contains_key(X_RETRY_REMAINING));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Too many requests");

        // A different client is unaffected
        let other = app.oneshot(request("/rate-limited", [10, 0, 0, 3])).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_route_has_no_headers() {
        let app = router(guard());

        for _ in 0..10 {
            let response = app
                .clone()
                .oneshot(request("/unrestricted", [10, 0, 0, 4]))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(RETRY_AFTER));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_matched_path_identifies_route() {
        let guard = AdmissionGuard::builder()
            .route(
                "/items/{id}",
                RouteConfig::limited(RateLimiterOptions {
                    key_prefix: Some("items".to_string()),
                    points: Some(1),
                    duration: Some(60),
                    ..Default::default()
                }),
            )
            .build()
            .unwrap();
        let app = router(guard);

        let first = app.clone().oneshot(request("/items/1", [10, 0, 0, 5])).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // Another concrete path of the same route shares the budget
        let second = app.oneshot(request("/items/2", [10, 0, 0, 5])).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_json_rejection() {
        let guard = AdmissionGuard::builder()
            .module_options(
                RateLimiterOptions {
                    points: Some(1),
                    duration: Some(60),
                    ..Default::default()
                }
                .with_custom_response(|outcome| {
                    serde_json::json!({
                        "error": "rate_limited",
                        "consumed": outcome.consumed_points(),
                    })
                }),
            )
            .build()
            .unwrap();
        let app = router(guard);

        app.clone().oneshot(request("/rate-limited", [10, 0, 0, 6])).await.unwrap();
        let response = app.oneshot(request("/rate-limited", [10, 0, 0, 6])).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["content-type"], "application/json");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["consumed"], 2);
    }
}
