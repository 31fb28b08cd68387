//! HTTP middleware components
//!
//! Everything here is configured from [`MiddlewareConfig`] and layered onto
//! a router by [`apply`]. The pre-built tower-http layers (trace, timeout,
//! body limit, gzip, panic recovery) are wrapped in small constructors; the
//! pieces the framework leaves to the application (request id, security
//! headers, rate limiting) are custom tower layers in their own modules.
//!
//! # Ordering
//!
//! Layers are applied so a request flows: logging → request id → security
//! headers → gzip → body limit → timeout → rate limit → recovery → handler.
//! With `Router::layer` the last layer added is the outermost, so [`apply`]
//! adds them in reverse.

pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

use std::any::Any;

use axum::{Json, Router, http::StatusCode, response::{IntoResponse, Response}};
use middlekit_config::{MiddlewareConfig, ParseSizeError};
use thiserror::Error;
use tower_http::{
    catch_panic::CatchPanicLayer,
    classify::{ServerErrorsAsFailures, SharedClassifier},
    compression::CompressionLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

pub use rate_limit::{
    MemoryStore, RateLimit, RateLimitLayer, RateLimitStore, RedisStore, StoreError,
};
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer, SetRequestId};
pub use security_headers::{SecurityHeaders, SecurityHeadersLayer};

use crate::error::ErrorResponse;

/// Errors raised while building the middleware stack
#[derive(Debug, Error)]
pub enum MiddlewareError {
    /// The configured body limit string could not be parsed
    #[error("invalid body limit: {0}")]
    BodyLimit(#[from] ParseSizeError),

    /// The rate limit store could not be built
    #[error("rate limit store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Access logging via tower-http's request tracing
#[must_use]
pub fn logging() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}

/// Panic recovery rendering the standard JSON error body
#[must_use]
pub fn recovery() -> CatchPanicLayer<fn(Box<dyn Any + Send + 'static>) -> Response> {
    CatchPanicLayer::custom(panic_response as fn(Box<dyn Any + Send + 'static>) -> Response)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: "Internal Server Error".to_string(),
        }),
    )
        .into_response()
}

/// Request timeout from the configured duration
#[must_use]
pub fn timeout(config: &MiddlewareConfig) -> TimeoutLayer {
    TimeoutLayer::new(config.timeout())
}

/// Request body size limit from the configured human-readable string
pub fn body_limit(config: &MiddlewareConfig) -> Result<RequestBodyLimitLayer, MiddlewareError> {
    Ok(RequestBodyLimitLayer::new(config.max_body_bytes()?))
}

/// Gzip response compression
#[must_use]
pub fn gzip() -> CompressionLayer {
    CompressionLayer::new()
}

/// Apply the full middleware stack to a router.
///
/// Building the rate limit store is the only fallible part: a malformed
/// body limit string or an unreachable Redis store fails startup.
pub async fn apply(router: Router, config: &MiddlewareConfig) -> Result<Router, MiddlewareError> {
    let rate_limit = RateLimitLayer::from_config(&config.rate_limit).await?;

    Ok(router
        .layer(recovery())
        .layer(rate_limit)
        .layer(timeout(config))
        .layer(body_limit(config)?)
        .layer(gzip())
        .layer(SecurityHeadersLayer::new())
        .layer(RequestIdLayer::new())
        .layer(logging()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Body, extract::Request, routing::get};
    use tower::ServiceExt;

    use super::*;

    async fn test_handler() -> &'static str {
        "ok"
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_slow_handlers() {
        let config = MiddlewareConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let app = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "done"
                }),
            )
            .layer(timeout(&config));

        let response = app
            .oneshot(Request::builder().uri("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn timeout_passes_fast_handlers() {
        let config = MiddlewareConfig::default();
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(timeout(&config));

        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn body_limit_rejects_oversized_payloads() {
        let config = MiddlewareConfig {
            body_limit: "1K".to_string(),
            ..Default::default()
        };
        let app = Router::new()
            .route("/test", axum::routing::post(|body: String| async move { body }))
            .layer(body_limit(&config).unwrap());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test")
                    .body(Body::from(vec![b'a'; 2048]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn body_limit_passes_small_payloads() {
        let config = MiddlewareConfig {
            body_limit: "1K".to_string(),
            ..Default::default()
        };
        let app = Router::new()
            .route("/test", axum::routing::post(|body: String| async move { body }))
            .layer(body_limit(&config).unwrap());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn body_limit_rejects_malformed_config() {
        let config = MiddlewareConfig {
            body_limit: "huge".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            body_limit(&config),
            Err(MiddlewareError::BodyLimit(_))
        ));
    }

    #[allow(clippy::panic)]
    async fn panicking_handler() -> &'static str {
        panic!("handler exploded")
    }

    #[tokio::test]
    async fn recovery_renders_the_fixed_json_body() {
        let app = Router::new()
            .route("/boom", get(panicking_handler))
            .layer(recovery());

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], br#"{"error":"Internal Server Error"}"#);
    }

    #[tokio::test]
    async fn gzip_compresses_when_the_client_accepts_it() {
        let app = Router::new()
            .route("/big", get(|| async { "x".repeat(4096) }))
            .layer(gzip());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/big")
                    .header("accept-encoding", "gzip")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("content-encoding")
                .and_then(|v| v.to_str().ok()),
            Some("gzip")
        );
    }

    #[tokio::test]
    async fn apply_builds_a_working_stack() {
        let config = MiddlewareConfig::default();
        let app = apply(Router::new().route("/test", get(test_handler)), &config)
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert!(response.headers().contains_key("x-frame-options"));
    }

    #[tokio::test]
    async fn apply_rejects_malformed_body_limit() {
        let config = MiddlewareConfig {
            body_limit: "huge".to_string(),
            ..Default::default()
        };
        let result = apply(Router::new(), &config).await;
        assert!(matches!(result, Err(MiddlewareError::BodyLimit(_))));
    }
}
