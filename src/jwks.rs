//! JWK serialization and the `/key/{kid}` endpoint.
//!
//! Serves the public half of a single signing key as a JWK (not a JWK Set).
//! Unknown key ids answer 404 with an empty JSON object.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;

/// A public JSON Web Key. Algorithm-family-specific fields are optional and
/// omitted when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC", "OKP").
    pub kty: String,
    /// Key ID.
    pub kid: String,
    /// Algorithm (e.g. "RS256").
    pub alg: String,
    /// Key use; always "sig" here.
    pub r#use: String,
    /// RSA modulus (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    /// Curve name ("P-256", "P-384", "Ed25519").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// Curve point x, or the Ed25519 public key (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// Curve point y (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    fn base(kid: &str, kty: &str, alg: &str) -> Self {
        Self {
            kty: kty.to_string(),
            kid: kid.to_string(),
            alg: alg.to_string(),
            r#use: "sig".to_string(),
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        }
    }

    pub fn rsa(kid: &str, alg: &str, n: String, e: String) -> Self {
        Self {
            n: Some(n),
            e: Some(e),
            ..Self::base(kid, "RSA", alg)
        }
    }

    pub fn ec(kid: &str, alg: &str, crv: &str, x: String, y: String) -> Self {
        Self {
            crv: Some(crv.to_string()),
            x: Some(x),
            y: Some(y),
            ..Self::base(kid, "EC", alg)
        }
    }

    pub fn ed(kid: &str, x: String) -> Self {
        Self {
            crv: Some("Ed25519".to_string()),
            x: Some(x),
            ..Self::base(kid, "OKP", "EdDSA")
        }
    }
}

/// Handler for `GET /key/{kid}`.
pub async fn key(State(state): State<Arc<AppState>>, Path(kid): Path<String>) -> Response {
    match state.keys.public(&kid).await {
        Some(jwk) => Json(jwk).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({}))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::BuilderSet;
    use crate::key::{KeySpec, KeyStore};
    use crate::token::TokenFactory;

    fn state_with_keys(keys: KeyStore) -> Arc<AppState> {
        Arc::new(AppState {
            settings: crate::config::from_yaml("{}").unwrap(),
            factory: TokenFactory::new(keys.clone(), "k".to_string(), KeySpec::Ed25519),
            keys,
            builders: BuilderSet::from_config(&Default::default()),
            resolver: None,
        })
    }

    #[tokio::test]
    async fn unknown_kid_is_404_with_empty_object_body() {
        let state = state_with_keys(KeyStore::new());

        let response = key(State(state), Path("ghost".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&bytes).unwrap(), json!({}));
    }

    #[tokio::test]
    async fn known_kid_serves_its_jwk() {
        let keys = KeyStore::new();
        keys.get_or_create("k", &KeySpec::Ed25519).await.unwrap();
        let state = state_with_keys(keys);

        let response = key(State(state), Path("k".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let jwk: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(jwk["kid"], json!("k"));
        assert_eq!(jwk["kty"], json!("OKP"));
        assert_eq!(jwk["alg"], json!("EdDSA"));
    }

    #[test]
    fn rsa_jwk_serializes_family_fields_only() {
        let jwk = Jwk::rsa("k1", "RS256", "abc".to_string(), "AQAB".to_string());
        let value = serde_json::to_value(&jwk).unwrap();

        assert_eq!(value["kty"], "RSA");
        assert_eq!(value["kid"], "k1");
        assert_eq!(value["use"], "sig");
        assert_eq!(value["n"], "abc");
        assert_eq!(value["e"], "AQAB");
        assert!(value.get("crv").is_none());
        assert!(value.get("x").is_none());
    }

    #[test]
    fn ed_jwk_is_okp_with_x_only() {
        let jwk = Jwk::ed("k2", "pubkey".to_string());
        let value = serde_json::to_value(&jwk).unwrap();

        assert_eq!(value["kty"], "OKP");
        assert_eq!(value["crv"], "Ed25519");
        assert_eq!(value["x"], "pubkey");
        assert!(value.get("n").is_none());
        assert!(value.get("y").is_none());
    }
}
