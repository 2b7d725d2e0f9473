//! Cryptographic key management.
//!
//! Owns the mapping from key id to signing key pair. Pairs are generated on
//! the first request that names them (or eagerly at startup) and live for
//! the process duration; private material never leaves this module. The
//! public half of every pair is precomputed as a JWK at birth.

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey};
use moka::future::Cache;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use thiserror::Error;

use crate::config::{Alg, Curve, KeyConfig, KeyFamily};
use crate::jwks::Jwk;

/// Cloneable so one in-flight generation failure can be handed to every
/// coalesced caller.
#[derive(Clone, Debug, Error)]
pub enum KeyError {
    #[error("unsupported algorithm: {0}")]
    Unsupported(String),

    #[error("key generation failed: {0}")]
    Generation(String),
}

impl From<KeyError> for crate::error::Error {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::Unsupported(s) => crate::error::Error::UnsupportedAlgorithm(s),
            KeyError::Generation(s) => crate::error::Error::GenerationFailed(s),
        }
    }
}

/// What to generate when an absent key id is first named.
#[derive(Clone, Debug)]
pub enum KeySpec {
    Rsa { bits: usize, alg: Algorithm },
    Ec { curve: Curve },
    Ed25519,
}

impl KeySpec {
    /// Derives the generation spec from the `key` section, honoring the
    /// configured signing algorithm (compatibility was checked at load).
    pub fn from_config(key: &KeyConfig, alg: Option<Alg>) -> Result<Self, KeyError> {
        match key.family {
            KeyFamily::Rsa => Ok(KeySpec::Rsa {
                bits: key.bits,
                alg: algorithm(alg.unwrap_or(Alg::RS256))?,
            }),
            KeyFamily::Ec => Ok(KeySpec::Ec { curve: key.curve }),
            KeyFamily::Ed25519 => Ok(KeySpec::Ed25519),
        }
    }
}

fn algorithm(alg: Alg) -> Result<Algorithm, KeyError> {
    match alg {
        Alg::RS256 => Ok(Algorithm::RS256),
        Alg::RS384 => Ok(Algorithm::RS384),
        Alg::RS512 => Ok(Algorithm::RS512),
        Alg::ES256 => Ok(Algorithm::ES256),
        Alg::ES384 => Ok(Algorithm::ES384),
        Alg::ES512 => Err(KeyError::Unsupported("ES512".to_string())),
        Alg::EdDSA => Ok(Algorithm::EdDSA),
    }
}

pub fn alg_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::EdDSA => "EdDSA",
        _ => "unknown",
    }
}

/// One signing key pair. The encoding key stays private to the store and
/// the token factory; everything else is serviced from the JWK.
pub struct KeyPair {
    pub kid: String,
    pub alg: Algorithm,
    encoding: EncodingKey,
    pub jwk: Jwk,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .field("jwk", &self.jwk)
            .finish()
    }
}

impl KeyPair {
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }
}

/// Map of key id to key pair with single-flight creation: concurrent
/// callers for the same absent id observe exactly one generation.
#[derive(Clone)]
pub struct KeyStore {
    keys: Cache<String, Arc<KeyPair>>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        // no TTL, no capacity bound: pairs live for the process lifetime
        Self {
            keys: Cache::builder().build(),
        }
    }

    /// Returns the pair for `kid`, generating it per `spec` when absent.
    pub async fn get_or_create(&self, kid: &str, spec: &KeySpec) -> Result<Arc<KeyPair>, KeyError> {
        let owned_kid = kid.to_string();
        let spec = spec.clone();
        self.keys
            .try_get_with(kid.to_string(), async move {
                tracing::info!(kid = %owned_kid, "generating signing key");
                let pair = tokio::task::spawn_blocking(move || generate(&owned_kid, &spec))
                    .await
                    .map_err(|e| KeyError::Generation(format!("generation task: {e}")))??;
                Ok(Arc::new(pair))
            })
            .await
            .map_err(|e: Arc<KeyError>| (*e).clone())
    }

    pub async fn get(&self, kid: &str) -> Option<Arc<KeyPair>> {
        self.keys.get(kid).await
    }

    /// Public half as a JWK. Never generates.
    pub async fn public(&self, kid: &str) -> Option<Jwk> {
        self.get(kid).await.map(|pair| pair.jwk.clone())
    }

    /// Installs a pre-provisioned pair (PEM file path). First write wins.
    pub async fn install(&self, pair: KeyPair) {
        self.keys
            .get_with(pair.kid.clone(), async move { Arc::new(pair) })
            .await;
    }
}

fn generate(kid: &str, spec: &KeySpec) -> Result<KeyPair, KeyError> {
    match spec {
        KeySpec::Rsa { bits, alg } => {
            let private = RsaPrivateKey::new(&mut rand::thread_rng(), *bits)
                .map_err(|e| KeyError::Generation(e.to_string()))?;
            rsa_pair(kid, private, *alg)
        }
        KeySpec::Ec { curve: Curve::P256 } => {
            let secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
            let pem = secret
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KeyError::Generation(e.to_string()))?;
            let encoding = EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| KeyError::Generation(e.to_string()))?;

            let point = secret.public_key().to_encoded_point(false);
            let (x, y) = match (point.x(), point.y()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(KeyError::Generation("point at infinity".to_string())),
            };
            Ok(KeyPair {
                kid: kid.to_string(),
                alg: Algorithm::ES256,
                encoding,
                jwk: Jwk::ec(
                    kid,
                    "ES256",
                    "P-256",
                    URL_SAFE_NO_PAD.encode(x),
                    URL_SAFE_NO_PAD.encode(y),
                ),
            })
        }
        KeySpec::Ec { curve: Curve::P384 } => {
            let secret = p384::SecretKey::random(&mut rand::rngs::OsRng);
            let pem = secret
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KeyError::Generation(e.to_string()))?;
            let encoding = EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| KeyError::Generation(e.to_string()))?;

            let point = secret.public_key().to_encoded_point(false);
            let (x, y) = match (point.x(), point.y()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(KeyError::Generation("point at infinity".to_string())),
            };
            Ok(KeyPair {
                kid: kid.to_string(),
                alg: Algorithm::ES384,
                encoding,
                jwk: Jwk::ec(
                    kid,
                    "ES384",
                    "P-384",
                    URL_SAFE_NO_PAD.encode(x),
                    URL_SAFE_NO_PAD.encode(y),
                ),
            })
        }
        KeySpec::Ec { curve: Curve::P521 } => {
            Err(KeyError::Unsupported("P-521 / ES512".to_string()))
        }
        KeySpec::Ed25519 => {
            let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
            let pem = signing
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| KeyError::Generation(e.to_string()))?;
            let encoding = EncodingKey::from_ed_pem(pem.as_bytes())
                .map_err(|e| KeyError::Generation(e.to_string()))?;

            let x = URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes());
            Ok(KeyPair {
                kid: kid.to_string(),
                alg: Algorithm::EdDSA,
                encoding,
                jwk: Jwk::ed(kid, x),
            })
        }
    }
}

fn rsa_pair(kid: &str, private: RsaPrivateKey, alg: Algorithm) -> Result<KeyPair, KeyError> {
    // re-encode so the signer always sees PKCS#8, whatever the source
    let pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::Generation(e.to_string()))?;
    let encoding = EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| KeyError::Generation(e.to_string()))?;

    let public = private.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());

    Ok(KeyPair {
        kid: kid.to_string(),
        alg,
        encoding,
        jwk: Jwk::rsa(kid, alg_name(alg), n, e),
    })
}

/// Loads the default key from a PKCS#8 PEM file (RSA).
pub fn load_rsa_pem(kid: &str, path: &Path, alg: Option<Alg>) -> Result<KeyPair, KeyError> {
    let alg = algorithm(alg.unwrap_or(Alg::RS256))?;
    let pem = std::fs::read_to_string(path)
        .map_err(|e| KeyError::Generation(format!("read {}: {e}", path.display())))?;
    let private = RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| KeyError::Generation(format!("parse {}: {e}", path.display())))?;
    rsa_pair(kid, private, alg)
}
