//! Token factory and the `/issue` and `/claims` endpoints.
//!
//! `/issue` runs context extraction, the claim builder set, and the factory,
//! answering with the compact JWT. `/claims` stops before signing and
//! answers with the claim map, which makes the configured pipeline
//! inspectable without spending a signature.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{encode, Header};

use crate::claims::ClaimMap;
use crate::context::RequestContext;
use crate::error::Error;
use crate::key::{KeySpec, KeyStore};
use crate::AppState;

/// Mints compact JWTs. Key selection order: the caller's hint when the
/// store already holds that pair, the configured default otherwise,
/// generated on first use.
pub struct TokenFactory {
    keys: KeyStore,
    default_kid: String,
    spec: KeySpec,
}

impl TokenFactory {
    pub fn new(keys: KeyStore, default_kid: String, spec: KeySpec) -> Self {
        Self {
            keys,
            default_kid,
            spec,
        }
    }

    /// Generates the default pair ahead of the first request.
    pub async fn warm(&self) -> Result<(), Error> {
        self.default_pair().await?;
        Ok(())
    }

    pub async fn mint(&self, claims: &ClaimMap, key_hint: Option<&str>) -> Result<String, Error> {
        let pair = match key_hint {
            Some(hint) => match self.keys.get(hint).await {
                Some(pair) => pair,
                None => self.default_pair().await?,
            },
            None => self.default_pair().await?,
        };

        let mut header = Header::new(pair.alg);
        header.kid = Some(pair.kid.clone());

        encode(&header, claims, pair.encoding_key())
            .map_err(|e| Error::SigningFailed(e.to_string()))
    }

    async fn default_pair(&self) -> Result<Arc<crate::key::KeyPair>, Error> {
        if self.default_kid.is_empty() {
            return Err(Error::NoKeyAvailable);
        }
        self.keys
            .get_or_create(&self.default_kid, &self.spec)
            .await
            .map_err(Error::from)
    }
}

/// Handler for `GET /issue`.
pub async fn issue(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match tokio::time::timeout(state.settings.request_timeout, issue_inner(&state, req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => e.into_response(),
        Err(_) => Error::RequestTimeout.into_response(),
    }
}

async fn issue_inner(state: &AppState, req: Request) -> Result<Response, Error> {
    let ctx = RequestContext::from_request(req).await;
    let claims = build_claims(state, &ctx).await?;
    let token = state.factory.mint(&claims, ctx.param("kid")).await?;

    Ok(([(header::CONTENT_TYPE, "application/jwt")], token).into_response())
}

/// Handler for `GET /claims`.
pub async fn claims(State(state): State<Arc<AppState>>, req: Request) -> Response {
    match tokio::time::timeout(state.settings.request_timeout, claims_inner(&state, req)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => e.into_response(),
        Err(_) => Error::RequestTimeout.into_response(),
    }
}

async fn claims_inner(state: &AppState, req: Request) -> Result<Response, Error> {
    let ctx = RequestContext::from_request(req).await;
    let claims = build_claims(state, &ctx).await?;

    let body = if ctx.param("pretty").is_some() {
        serde_json::to_string_pretty(&claims)
    } else {
        serde_json::to_string(&claims)
    }
    .map_err(|e| Error::SigningFailed(e.to_string()))?;

    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn build_claims(state: &AppState, ctx: &RequestContext) -> Result<ClaimMap, Error> {
    state
        .builders
        .evaluate(ctx, ctx.received_at, state.resolver.as_ref())
        .await
}
