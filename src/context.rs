//! Request context extraction.
//!
//! Builds the read-only per-request snapshot that every claim builder
//! evaluates against: method, path, headers, merged query and form-body
//! parameters, optional peer-certificate subject attributes, and the
//! arrival timestamp. Form parsing happens here, before any builder runs.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, Method};

use crate::config::CertAttr;

/// Cap on a form body; claim parameters are tiny.
const MAX_FORM_BYTES: usize = 64 * 1024;

/// Subject attributes of a verified peer certificate.
///
/// The transport layer inserts this as a request extension when TLS client
/// authentication verified a certificate; without it, certificate builders
/// see no peer.
#[derive(Clone, Debug, Default)]
pub struct PeerCertificate {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub serial: Option<String>,
}

impl PeerCertificate {
    pub fn attr(&self, attr: CertAttr) -> Option<&str> {
        match attr {
            CertAttr::Cn => self.common_name.as_deref(),
            CertAttr::O => self.organization.as_deref(),
            CertAttr::Ou => self.organizational_unit.as_deref(),
            CertAttr::Serial => self.serial.as_deref(),
        }
    }
}

/// Read-only snapshot of one inbound request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    params: HashMap<String, Vec<String>>,
    pub peer_cert: Option<PeerCertificate>,
    /// Arrival time, seconds since the epoch.
    pub received_at: u64,
}

impl RequestContext {
    /// Consumes the request. Query parameters merge with form-body
    /// parameters; on collision the body value is seen first.
    pub async fn from_request(req: Request) -> Self {
        let (parts, body) = req.into_parts();

        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        if is_form(&parts.headers) {
            for (k, v) in read_form_body(body).await {
                params.entry(k).or_default().push(v);
            }
        }
        if let Some(query) = parts.uri.query() {
            match serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
                Ok(pairs) => {
                    for (k, v) in pairs {
                        params.entry(k).or_default().push(v);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "unparseable query string ignored"),
            }
        }

        let peer_cert = parts.extensions.get::<PeerCertificate>().cloned();

        let ctx = Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            params,
            peer_cert,
            received_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        tracing::trace!(
            method = %ctx.method,
            path = %ctx.path,
            params = ctx.params.len(),
            has_cert = ctx.peer_cert.is_some(),
            "request context built"
        );
        ctx
    }

    /// Case-insensitive header lookup; non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First value for a parameter, form body before query string.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|vs| vs.first())
            .map(String::as_str)
    }

    pub fn cert_attr(&self, attr: CertAttr) -> Option<&str> {
        self.peer_cert.as_ref().and_then(|c| c.attr(attr))
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

async fn read_form_body(body: Body) -> Vec<(String, String)> {
    let bytes = match axum::body::to_bytes(body, MAX_FORM_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read form body");
            return Vec::new();
        }
    };
    match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&bytes) {
        Ok(pairs) => pairs,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable form body ignored");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    fn get_request(uri: &str) -> Request {
        HttpRequest::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn query_parameters_are_extracted() {
        let ctx = RequestContext::from_request(get_request("/issue?pid=acme&scope=read")).await;
        assert_eq!(ctx.param("pid"), Some("acme"));
        assert_eq!(ctx.param("scope"), Some("read"));
        assert_eq!(ctx.param("missing"), None);
        assert_eq!(ctx.path, "/issue");
    }

    #[tokio::test]
    async fn form_body_takes_precedence_over_query() {
        let req = HttpRequest::builder()
            .method(Method::POST)
            .uri("/issue?pid=from-query")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("pid=from-body"))
            .unwrap();

        let ctx = RequestContext::from_request(req).await;
        assert_eq!(ctx.param("pid"), Some("from-body"));
    }

    #[tokio::test]
    async fn header_lookup_is_case_insensitive() {
        let req = HttpRequest::builder()
            .method(Method::GET)
            .uri("/issue")
            .header("X-Partner-ID", "acme")
            .body(Body::empty())
            .unwrap();

        let ctx = RequestContext::from_request(req).await;
        assert_eq!(ctx.header("x-partner-id"), Some("acme"));
        assert_eq!(ctx.header("X-PARTNER-ID"), Some("acme"));
    }

    #[tokio::test]
    async fn cert_attrs_come_from_the_request_extension() {
        let mut req = get_request("/issue");
        req.extensions_mut().insert(PeerCertificate {
            common_name: Some("device-001".to_string()),
            organization: Some("Acme".to_string()),
            ..Default::default()
        });

        let ctx = RequestContext::from_request(req).await;
        assert_eq!(ctx.cert_attr(CertAttr::Cn), Some("device-001"));
        assert_eq!(ctx.cert_attr(CertAttr::Serial), None);
    }

    #[tokio::test]
    async fn no_certificate_means_no_attributes() {
        let ctx = RequestContext::from_request(get_request("/issue")).await;
        assert!(ctx.peer_cert.is_none());
        assert_eq!(ctx.cert_attr(CertAttr::Cn), None);
    }
}
