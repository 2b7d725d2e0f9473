//! Remote claim resolution.
//!
//! Backs `remote` claim builders: renders a URL (and optional body) template
//! against the request context, fetches attributes from the partner service
//! with retries, selects a subtree of the JSON response, and memoizes
//! successful lookups. Concurrent lookups for the same rendered key coalesce
//! into one outbound request.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use moka::future::Cache;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::config::{CertAttr, ClientConfig, ConfigError, RemoteConfig, RetryConfig};
use crate::context::RequestContext;
use crate::error::Error;

/// Failures of a remote lookup. Cloneable so one in-flight failure can be
/// handed to every coalesced caller.
#[derive(Clone, Debug, Error)]
pub enum ResolveError {
    /// The per-attempt timeout fired on the last attempt.
    #[error("partner lookup timed out")]
    Timeout,

    /// All attempts exhausted on network errors or 5xx responses.
    #[error("partner unavailable: {0}")]
    Unavailable(String),

    /// Non-retryable response status (4xx).
    #[error("partner returned status {0}")]
    BadStatus(u16),

    /// The response body failed to parse, or the path expression selected
    /// nothing.
    #[error("partner response malformed: {0}")]
    Malformed(String),
}

impl ResolveError {
    pub fn status(&self) -> StatusCode {
        match self {
            ResolveError::Timeout | ResolveError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ResolveError::BadStatus(_) | ResolveError::Malformed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Timeout | ResolveError::Unavailable(_))
    }
}

/// Builds the shared outbound client from the `client` configuration
/// section. One client, one connection pool, reused across requests.
pub fn build_client(cfg: &ClientConfig) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(cfg.timeout)
        .pool_idle_timeout(cfg.keep_alive)
        .pool_max_idle_per_host(cfg.max_idle)
        .build()
        .map_err(|e| ConfigError::Invalid(format!("outbound client: {e}")))
}

pub struct Resolver {
    client: reqwest::Client,
    cfg: RemoteConfig,
    method: reqwest::Method,
    cache: Cache<String, Value>,
}

impl Resolver {
    pub fn new(cfg: RemoteConfig, client: reqwest::Client) -> Self {
        let cache = Cache::builder()
            .time_to_live(cfg.cache_ttl)
            .max_capacity(cfg.cache_capacity)
            .build();
        // method string is validated at config load
        let method = reqwest::Method::from_bytes(cfg.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        Self {
            client,
            cfg,
            method,
            cache,
        }
    }

    /// Resolves a value for the request. `template` overrides the configured
    /// URL when the builder carries its own.
    ///
    /// The rendered URL (plus rendered body, when configured) is the cache
    /// and coalescing key. Only successful lookups are cached.
    pub async fn resolve(
        &self,
        template: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Value, Error> {
        let url = render(template.unwrap_or(&self.cfg.url), ctx)?;
        let body = match &self.cfg.body {
            Some(t) => Some(render(t, ctx)?),
            None => None,
        };
        let key = match &body {
            Some(b) => format!("{url}\n{b}"),
            None => url.clone(),
        };

        self.cache
            .try_get_with(key, self.fetch(url, body))
            .await
            .map_err(|e: Arc<ResolveError>| Error::Resolve((*e).clone()))
    }

    /// One fetch, retried with exponential backoff. Network errors and 5xx
    /// retry; 4xx and malformed bodies do not.
    async fn fetch(&self, url: String, body: Option<String>) -> Result<Value, ResolveError> {
        let retries = &self.cfg.retries;
        let mut last: Option<ResolveError> = None;

        for attempt in 0..retries.max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(retries, attempt - 1);
                tracing::debug!(
                    url = %url,
                    attempt = attempt + 1,
                    max_attempts = retries.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying partner lookup"
                );
                tokio::time::sleep(delay).await;
            }

            match self.attempt(&url, body.as_deref()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last.unwrap_or_else(|| ResolveError::Unavailable("no attempts made".to_string())))
    }

    async fn attempt(&self, url: &str, body: Option<&str>) -> Result<Value, ResolveError> {
        let mut request = self
            .client
            .request(self.method.clone(), url)
            .timeout(self.cfg.timeout);
        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ResolveError::Unavailable(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(ResolveError::BadStatus(status.as_u16()));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| ResolveError::Malformed(e.to_string()))?;

        match self.cfg.path.as_deref() {
            Some(path) if !path.is_empty() => value
                .pointer(path)
                .cloned()
                .ok_or_else(|| ResolveError::Malformed(format!("nothing at path {path}"))),
            _ => Ok(value),
        }
    }
}

fn classify_transport(e: reqwest::Error) -> ResolveError {
    if e.is_timeout() {
        ResolveError::Timeout
    } else {
        ResolveError::Unavailable(e.to_string())
    }
}

/// Doubling backoff capped at `max_backoff`, plus 0-50% jitter.
fn backoff_delay(cfg: &RetryConfig, prior_attempts: u32) -> Duration {
    let exp = 2u32.saturating_pow(prior_attempts);
    let base = cfg.initial_backoff.saturating_mul(exp).min(cfg.max_backoff);
    base + base.mul_f64(rand::thread_rng().gen_range(0.0..0.5))
}

/// Renders `{header.*}` / `{param.*}` / `{cert.*}` placeholders against the
/// request context. A missing input surfaces as the matching 400-class
/// error.
pub fn render(template: &str, ctx: &RequestContext) -> Result<String, Error> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&lookup(&after[..end], ctx)?);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn lookup(key: &str, ctx: &RequestContext) -> Result<String, Error> {
    match key.split_once('.') {
        Some(("header", name)) => ctx
            .header(name)
            .map(str::to_string)
            .ok_or_else(|| Error::MissingHeader(name.to_string())),
        Some(("param", name)) => ctx
            .param(name)
            .map(str::to_string)
            .ok_or_else(|| Error::MissingParameter(name.to_string())),
        Some(("cert", attr)) => {
            let attr = cert_attr(attr)
                .ok_or_else(|| Error::Resolve(ResolveError::Malformed(format!(
                    "unknown certificate attribute in template: {attr}"
                ))))?;
            ctx.cert_attr(attr)
                .map(str::to_string)
                .ok_or_else(|| Error::MissingCertAttr(attr.as_str().to_string()))
        }
        _ => Err(Error::Resolve(ResolveError::Malformed(format!(
            "unknown template placeholder: {key}"
        )))),
    }
}

fn cert_attr(name: &str) -> Option<CertAttr> {
    match name {
        "cn" => Some(CertAttr::Cn),
        "o" => Some(CertAttr::O),
        "ou" => Some(CertAttr::Ou),
        "serial" => Some(CertAttr::Serial),
        _ => None,
    }
}

/// Load-time template check: every placeholder must be well-formed. Used by
/// configuration validation so typos fail the startup, not the request.
pub fn check_template(template: &str) -> Result<(), String> {
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Ok(());
        };
        let key = &after[..end];
        let ok = match key.split_once('.') {
            Some(("header", name)) | Some(("param", name)) => !name.is_empty(),
            Some(("cert", attr)) => cert_attr(attr).is_some(),
            _ => false,
        };
        if !ok {
            return Err(format!("unknown template placeholder: {key}"));
        }
        rest = &after[end + 1..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn ctx_with_header(name: &str, value: &str) -> RequestContext {
        let req = HttpRequest::builder()
            .uri("/issue")
            .header(name, value)
            .body(Body::empty())
            .unwrap();
        RequestContext::from_request(req).await
    }

    fn resolver_for(server_url: &str, overrides: impl FnOnce(&mut RemoteConfig)) -> Resolver {
        let mut cfg = RemoteConfig {
            url: format!("{server_url}/attributes/{{header.x-partner-id}}"),
            ..RemoteConfig::default()
        };
        // keep test retries fast
        cfg.retries.initial_backoff = Duration::from_millis(5);
        cfg.retries.max_backoff = Duration::from_millis(20);
        overrides(&mut cfg);
        Resolver::new(cfg, reqwest::Client::new())
    }

    #[tokio::test]
    async fn resolves_and_caches_by_rendered_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/attributes/acme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tier": "gold"})))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver_for(&server.uri(), |_| {});
        let ctx = ctx_with_header("x-partner-id", "acme").await;

        let first = resolver.resolve(None, &ctx).await.unwrap();
        let second = resolver.resolve(None, &ctx).await.unwrap();
        assert_eq!(first, json!({"tier": "gold"}));
        assert_eq!(second, first);
        // expect(1) verified on drop: second call was served from cache
    }

    #[tokio::test]
    async fn path_expression_selects_a_subtree() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"attributes": {"tier": "gold", "region": "us"}})),
            )
            .mount(&server)
            .await;

        let resolver = resolver_for(&server.uri(), |cfg| {
            cfg.path = Some("/attributes/tier".to_string());
        });
        let ctx = ctx_with_header("x-partner-id", "acme").await;

        assert_eq!(resolver.resolve(None, &ctx).await.unwrap(), json!("gold"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver_for(&server.uri(), |_| {});
        let ctx = ctx_with_header("x-partner-id", "acme").await;

        let err = resolver.resolve(None, &ctx).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Resolve(ResolveError::BadStatus(404))
        ));
    }

    #[tokio::test]
    async fn server_errors_retry_until_attempts_exhaust() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let resolver = resolver_for(&server.uri(), |cfg| {
            cfg.retries.max_attempts = 3;
        });
        let ctx = ctx_with_header("x-partner-id", "acme").await;

        let err = resolver.resolve(None, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Resolve(ResolveError::Unavailable(_))));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let server = MockServer::start().await;
        {
            let _failing = Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(500))
                .expect(2)
                .mount_as_scoped(&server)
                .await;

            let resolver = resolver_for(&server.uri(), |cfg| {
                cfg.retries.max_attempts = 2;
            });
            let ctx = ctx_with_header("x-partner-id", "acme").await;
            resolver.resolve(None, &ctx).await.unwrap_err();

            drop(_failing);
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tier": "gold"})))
                .mount(&server)
                .await;

            let value = resolver.resolve(None, &ctx).await.unwrap();
            assert_eq!(value, json!({"tier": "gold"}));
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_coalesce() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"tier": "gold"}))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let resolver = std::sync::Arc::new(resolver_for(&server.uri(), |_| {}));
        let ctx = ctx_with_header("x-partner-id", "acme").await;

        let (a, b) = tokio::join!(resolver.resolve(None, &ctx), resolver.resolve(None, &ctx));
        assert_eq!(a.unwrap(), json!({"tier": "gold"}));
        assert_eq!(b.unwrap(), json!({"tier": "gold"}));
    }

    #[tokio::test]
    async fn missing_template_input_is_a_400_class_error() {
        let resolver = resolver_for("http://partner.invalid", |_| {});
        let ctx = ctx_with_header("x-other", "x").await;

        let err = resolver.resolve(None, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::MissingHeader(name) if name == "x-partner-id"));
    }

    #[tokio::test]
    async fn render_substitutes_all_sources() {
        let req = HttpRequest::builder()
            .uri("/issue?pid=acme")
            .header("x-tenant", "t1")
            .body(Body::empty())
            .unwrap();
        let ctx = RequestContext::from_request(req).await;

        let rendered = render(
            "http://partner.local/{header.x-tenant}/{param.pid}",
            &ctx,
        )
        .unwrap();
        assert_eq!(rendered, "http://partner.local/t1/acme");
    }

    #[test]
    fn template_check_rejects_unknown_placeholders() {
        assert!(check_template("http://x/{header.a}/{param.b}").is_ok());
        assert!(check_template("http://x/{bogus.a}").is_err());
        assert!(check_template("http://x/{cert.nope}").is_err());
    }
}
