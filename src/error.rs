//! Request-path error taxonomy.
//!
//! Every failure that can reach the HTTP boundary is a variant here, with a
//! fixed status mapping. Clients always receive a small JSON body of the form
//! `{"code": <status>, "message": <text>}`; for 5xx failures the message is
//! generic and the detail stays in the log.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::resolver::ResolveError;

/// Errors raised while handling a single issuance or claims-preview request.
#[derive(Debug, Error)]
pub enum Error {
    /// A header builder was marked required and the header is absent.
    #[error("missing header: {0}")]
    MissingHeader(String),

    /// A parameter builder was marked required and the parameter is absent.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// A certificate builder was marked required and the transport presented
    /// no verified client certificate, or the subject lacks the attribute.
    #[error("missing certificate attribute: {0}")]
    MissingCertAttr(String),

    /// A variable builder named a key absent from the configured variable map.
    #[error("missing variable: {0}")]
    MissingVariable(String),

    /// A claim slated for duration rewriting held an unparseable value.
    #[error("invalid duration for claim {0}")]
    InvalidDuration(String),

    /// Remote claim resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// No key could be selected or produced for signing.
    #[error("no signing key available")]
    NoKeyAvailable,

    /// The signing operation itself failed.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// The OS entropy source returned an error.
    #[error("entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    /// Key generation failed.
    #[error("key generation failed: {0}")]
    GenerationFailed(String),

    /// The requested algorithm or curve is not supported by the signing stack.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The server-wide request deadline fired.
    #[error("request deadline exceeded")]
    RequestTimeout,
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::MissingHeader(_)
            | Error::MissingParameter(_)
            | Error::MissingCertAttr(_)
            | Error::MissingVariable(_)
            | Error::InvalidDuration(_) => StatusCode::BAD_REQUEST,
            Error::Resolve(e) => e.status(),
            Error::NoKeyAvailable
            | Error::SigningFailed(_)
            | Error::EntropyUnavailable(_)
            | Error::GenerationFailed(_)
            | Error::UnsupportedAlgorithm(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// The message shown to clients. Internal detail is withheld for 5xx.
    fn public_message(&self) -> String {
        let status = self.status();
        if status.is_server_error() {
            match self {
                Error::RequestTimeout => "request deadline exceeded".to_string(),
                Error::Resolve(_) => "claim resolution failed".to_string(),
                _ => "internal error".to_string(),
            }
        } else {
            self.to_string()
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }

        (
            status,
            Json(json!({
                "code": status.as_u16(),
                "message": self.public_message(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_is_bad_request_with_header_name() {
        let err = Error::MissingHeader("X-User".to_string());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "missing header: X-User");
    }

    #[test]
    fn server_errors_hide_detail() {
        let err = Error::SigningFailed("rsa private exponent mismatch".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn timeout_maps_to_504() {
        assert_eq!(Error::RequestTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
