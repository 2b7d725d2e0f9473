//! Per-endpoint server assembly.
//!
//! Each endpoint (issuer, claims, key, health) binds its own listener from
//! its own configuration section; any subset may be enabled. Every server
//! carries the correlation-id middleware and its configured pass-through
//! response headers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower::util::MapResponseLayer;

use crate::config::ServerConfig;
use crate::middleware::RequestIdLayer;
use crate::{jwks, token, AppState};

pub fn issuer_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/issue", get(token::issue))
        .with_state(state)
}

pub fn claims_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/claims", get(token::claims))
        .with_state(state)
}

pub fn key_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/key/{kid}", get(jwks::key))
        .with_state(state)
}

pub fn health_router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "up"}))
}

/// Binds and serves one configured endpoint server until it fails.
pub async fn run(
    name: &'static str,
    cfg: ServerConfig,
    router: Router,
    request_id_header: HeaderName,
) -> anyhow::Result<()> {
    let router = router
        .layer(MapResponseLayer::new(response_decorator(&cfg.headers)))
        .layer(RequestIdLayer::new(request_id_header));

    let listener = tokio::net::TcpListener::bind(cfg.address).await?;
    tracing::info!(server = name, address = %cfg.address, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Applies the configured pass-through headers to every response.
fn response_decorator(headers: &HashMap<String, String>) -> impl Fn(Response) -> Response + Clone {
    let pairs: Vec<(HeaderName, HeaderValue)> = headers
        .iter()
        .filter_map(|(name, value)| {
            match (name.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    tracing::warn!(header = %name, "unusable response header in configuration");
                    None
                }
            }
        })
        .collect();

    move |mut response: Response| {
        for (name, value) in &pairs {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_answers_up() {
        let response = health_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"status": "up"}));
    }

    #[tokio::test]
    async fn configured_headers_decorate_responses() {
        let mut headers = HashMap::new();
        headers.insert("x-service".to_string(), "banshee".to_string());
        headers.insert("not a header\n".to_string(), "dropped".to_string());

        let router =
            health_router().layer(MapResponseLayer::new(response_decorator(&headers)));
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.headers()["x-service"], "banshee");
    }
}
