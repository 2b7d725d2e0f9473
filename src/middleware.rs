//! Request correlation middleware.
//!
//! Takes the correlation id from the configured header (or generates one),
//! opens the per-request span every downstream log line lands in, and
//! echoes the id on the response so callers can quote it back.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::http::{HeaderName, HeaderValue, Request, Response};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tower::{Layer, Service};
use tracing::{span, Instrument};

const GENERATED_ID_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct RequestIdService<S> {
    inner: S,
    header: HeaderName,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestIdService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    // Boxed because instrumentation changes the future's type; the span is
    // attached to the future so route handlers run inside it.
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let id = req
            .headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(generate_id);

        let request_span = span!(
            tracing::Level::INFO,
            "request",
            endpoint = %req.uri().path(),
            httpMethod = %req.method(),
            request_id = %id,
        );

        let header = self.header.clone();
        let future = self.inner.call(req).instrument(request_span);

        Box::pin(async move {
            let mut response = future.await?;
            if let Ok(value) = HeaderValue::try_from(id) {
                response.headers_mut().insert(header, value);
            }
            Ok(response)
        })
    }
}

fn generate_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct RequestIdLayer {
    header: HeaderName,
}

impl RequestIdLayer {
    pub fn new(header: HeaderName) -> Self {
        RequestIdLayer { header }
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService {
            inner,
            header: self.header.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn router() -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(RequestIdLayer::new(HeaderName::from_static("x-request-id")))
    }

    #[tokio::test]
    async fn caller_supplied_id_is_echoed() {
        let response = router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ping")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn missing_id_is_generated() {
        let response = router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let id = response.headers()["x-request-id"].to_str().unwrap();
        assert_eq!(id.len(), GENERATED_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_id(), generate_id());
    }
}
