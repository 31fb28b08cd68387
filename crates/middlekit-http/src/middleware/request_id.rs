//! Request ID middleware for HTTP request correlation
//!
//! Reuses an inbound `x-request-id` header when present, otherwise generates
//! a random UUID. The id is stored in the request extensions, recorded on
//! the request's tracing span, and reflected on the response.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    extract::Request,
    http::header::HeaderValue,
    response::Response,
};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

/// The header name for the request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Layer that adds request ID handling to HTTP services
#[derive(Debug, Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    /// Create a new request ID layer
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = SetRequestId<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SetRequestId { inner }
    }
}

/// Service that reuses or generates a request ID for each request
#[derive(Debug, Clone)]
pub struct SetRequestId<S> {
    inner: S,
}

impl<S> Service<Request> for SetRequestId<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        // Reuse the caller-supplied id; generate only when the header is
        // missing or unreadable
        let id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let header_value = HeaderValue::from_str(&id).ok();
        if let Some(ref value) = header_value {
            request
                .headers_mut()
                .insert(REQUEST_ID_HEADER, value.clone());
        }
        request.extensions_mut().insert(RequestId(id.clone()));

        let span = tracing::info_span!(
            "http_request",
            request_id = %id,
            method = %request.method(),
            uri = %request.uri().path(),
        );

        let mut inner = self.inner.clone();

        Box::pin(
            async move {
                let mut response = inner.call(request).await?;

                if let Some(value) = header_value {
                    response.headers_mut().insert(REQUEST_ID_HEADER, value);
                }

                Ok(response)
            }
            .instrument(span),
        )
    }
}

/// Request ID taken from the request headers or generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    /// Get the request ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, routing::get};
    use tower::ServiceExt;

    use super::*;

    async fn test_handler() -> &'static str {
        "ok"
    }

    #[tokio::test]
    async fn generates_an_id_when_absent() {
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(RequestIdLayer::new());

        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn reflects_an_inbound_id_unchanged() {
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(RequestIdLayer::new());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER),
            Some(&HeaderValue::from_static("req-42"))
        );
    }

    #[tokio::test]
    async fn handlers_see_the_id_in_extensions() {
        async fn extension_handler(request: Request) -> String {
            request
                .extensions()
                .get::<RequestId>()
                .map(RequestId::to_string)
                .unwrap_or_default()
        }

        let app = Router::new()
            .route("/test", get(extension_handler))
            .layer(RequestIdLayer::new());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header(REQUEST_ID_HEADER, "req-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"req-7");
    }

    #[test]
    fn request_id_display_and_as_str() {
        let id = RequestId("req-1".to_string());
        assert_eq!(id.to_string(), "req-1");
        assert_eq!(id.as_str(), "req-1");
    }

    #[test]
    fn request_id_layer_is_zero_sized() {
        let layer = RequestIdLayer::new();
        assert!(std::mem::size_of_val(&layer) == 0);
    }
}
