//! Configuration management for Banshee.
//!
//! One typed [`Settings`] tree is loaded once at startup from `banshee.{yaml,toml,json}`
//! plus `BANSHEE_*` environment overrides, validated, and handed to each
//! component constructor. A configuration failure exits the process with
//! code 2.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Claim names owned by the JWT header. A builder targeting one of these is
/// rejected at load time.
pub const RESERVED_CLAIMS: &[&str] = &["alg", "kid", "typ"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("reserved claim: {0}")]
    ReservedClaim(String),

    #[error("malformed configuration: {0}")]
    Invalid(String),
}

/// Application configuration settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Per-endpoint servers. Any subset may be enabled.
    pub servers: Servers,
    /// Token shape: signing algorithm, claim builders, lifetime.
    pub token: TokenConfig,
    /// Default signing key identity and provisioning.
    pub key: KeyConfig,
    /// Entropy source selection.
    pub random: RandomConfig,
    /// Outbound HTTP client tuning for the remote claim resolver.
    pub client: ClientConfig,
    /// Server-wide deadline for a single request.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Header carrying the request correlation id; generated when absent.
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
    pub telemetry: TelemetryConfig,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

/// One optional server per endpoint; unset sections stay disabled.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Servers {
    pub issuer: Option<ServerConfig>,
    pub claims: Option<ServerConfig>,
    pub key: Option<ServerConfig>,
    pub health: Option<ServerConfig>,
    /// Recognized for compatibility with existing deployments; not served.
    pub metrics: Option<ServerConfig>,
    /// Recognized for compatibility with existing deployments; not served.
    pub pprof: Option<ServerConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address, e.g. "0.0.0.0:6500".
    pub address: SocketAddr,
    /// Set to keep the section in the file while skipping the listener.
    #[serde(default)]
    pub disabled: bool,
    /// Headers added to every response from this server.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Signing algorithms this service can declare in a JWT header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Alg {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
    EdDSA,
}

impl Alg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Alg::RS256 => "RS256",
            Alg::RS384 => "RS384",
            Alg::RS512 => "RS512",
            Alg::ES256 => "ES256",
            Alg::ES384 => "ES384",
            Alg::ES512 => "ES512",
            Alg::EdDSA => "EdDSA",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Signing algorithm. Defaults per key family: RSA -> RS256,
    /// P-256 -> ES256, P-384 -> ES384, Ed25519 -> EdDSA.
    pub alg: Option<Alg>,
    /// Token lifetime; when set, `exp = iat + duration`.
    #[serde(with = "humantime_serde")]
    pub duration: Option<Duration>,
    /// Clock-skew allowance; when set, `nbf = iat - delta`.
    #[serde(with = "humantime_serde")]
    pub not_before_delta: Option<Duration>,
    /// Auto-insert `iat` when no builder produced one.
    pub include_iat: bool,
    /// Shortcut builder: partner id from header, parameter, or default.
    pub partner_id: Option<PartnerIdConfig>,
    /// Shortcut builder: random `jti`-style nonce.
    pub nonce: Option<NonceConfig>,
    /// Ordered claim builders, evaluated first in configuration order.
    pub claims: Vec<BuilderConfig>,
    /// Variable map backing `variable` builders.
    pub variables: HashMap<String, Value>,
    /// Remote claim resolver wiring; required when a `remote` builder exists.
    pub remote: Option<RemoteConfig>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            alg: None,
            duration: None,
            not_before_delta: None,
            include_iat: true,
            partner_id: None,
            nonce: None,
            claims: Vec::new(),
            variables: HashMap::new(),
            remote: None,
        }
    }
}

/// Partner id lookup order: header, then form parameter, then default.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PartnerIdConfig {
    pub claim: String,
    pub header: String,
    pub parameter: String,
    pub default: Option<String>,
    pub required: bool,
}

impl Default for PartnerIdConfig {
    fn default() -> Self {
        Self {
            claim: "pid".to_string(),
            header: "X-Partner-ID".to_string(),
            parameter: "pid".to_string(),
            default: None,
            required: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NonceConfig {
    pub claim: String,
    pub bytes: usize,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            claim: "jti".to_string(),
            bytes: 16,
        }
    }
}

/// Which subject attribute a certificate builder extracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertAttr {
    Cn,
    O,
    Ou,
    Serial,
}

impl CertAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertAttr::Cn => "cn",
            CertAttr::O => "o",
            CertAttr::Ou => "ou",
            CertAttr::Serial => "serial",
        }
    }
}

/// One claim builder. Variants carry only the fields they need; the
/// evaluation loop dispatches on the tag.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuilderConfig {
    /// Insert a literal value verbatim.
    Static { claim: String, value: Value },
    /// Copy a request header.
    Header {
        claim: String,
        name: String,
        #[serde(default)]
        required: bool,
    },
    /// Copy a form or query parameter.
    Parameter {
        claim: String,
        name: String,
        #[serde(default)]
        required: bool,
    },
    /// Look up a key in the configured variable map.
    Variable {
        claim: String,
        key: String,
        #[serde(default)]
        required: bool,
    },
    /// Extract an attribute from the peer certificate subject.
    Certificate {
        claim: String,
        attr: CertAttr,
        #[serde(default)]
        required: bool,
    },
    /// Insert a fresh random value.
    Nonce { claim: String, bytes: usize },
    /// Insert a wall-clock value.
    Time {
        claim: String,
        kind: TimeKind,
        #[serde(default, with = "humantime_serde")]
        duration: Option<Duration>,
    },
    /// Insert a value (or merge a sub-map) resolved from the partner service.
    Remote {
        #[serde(default)]
        claim: Option<String>,
        /// URL template override; the resolver's configured URL otherwise.
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        optional: bool,
    },
    /// Rewrite a previously-inserted duration string into integer seconds.
    Duration { claim: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeKind {
    /// Current time.
    Iat,
    /// Current time plus the builder's duration.
    Exp,
    /// Current time minus the builder's duration.
    Nbf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Lookup URL; may contain `{header.*}` / `{param.*}` / `{cert.*}`
    /// placeholders rendered per request.
    pub url: String,
    pub method: String,
    /// Optional request body template, rendered like the URL.
    pub body: Option<String>,
    /// Per-attempt timeout; clamped to `request_timeout` at load.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retries: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    /// JSON pointer selecting the subtree inserted into the claim map.
    pub path: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            body: None,
            timeout: Duration::from_secs(5),
            retries: RetryConfig::default(),
            cache_ttl: Duration::from_secs(60),
            cache_capacity: 1024,
            path: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFamily {
    #[default]
    Rsa,
    Ec,
    Ed25519,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Curve {
    #[default]
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
    #[serde(rename = "P-521")]
    P521,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Key id for the default signing key; auto-generated when unset.
    pub kid: Option<String>,
    #[serde(rename = "type")]
    pub family: KeyFamily,
    /// RSA modulus size.
    pub bits: usize,
    /// EC curve.
    pub curve: Curve,
    /// PKCS#8 PEM file provisioning the default RSA key.
    pub file: Option<PathBuf>,
    /// Generate the default key at startup instead of on first use.
    pub eager: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            kid: None,
            family: KeyFamily::Rsa,
            bits: 2048,
            curve: Curve::P256,
            file: None,
            eager: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RandomConfig {
    /// Entropy source identifier. Only "os" is recognized.
    pub source: String,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            source: "os".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Whole-request timeout for outbound calls.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Idle connection keep-alive in the pool.
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Idle connections retained per host.
    pub max_idle: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(90),
            max_idle: 32,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Compact structured JSON for log pipelines. Default.
    #[default]
    Json,
    /// Human-readable output for development.
    Pretty,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Trace,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Output format for log messages.
    pub format: LoggingFormat,
    /// Global log level for the application.
    pub level: LogLevel,
    /// Log level for the axum/tower server stack.
    pub axum_level: LogLevel,
    /// Log level for outbound reqwest/hyper traffic.
    pub reqwest_level: LogLevel,
    /// Service name attached to logs and spans.
    pub service_name: String,
    /// Whether to enable OpenTelemetry (OTLP) exporting.
    pub otlp_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: Default::default(),
            level: LogLevel::Info,
            axum_level: LogLevel::Info,
            reqwest_level: LogLevel::Warn,
            service_name: "banshee".to_string(),
            otlp_enabled: false,
        }
    }
}

impl Settings {
    /// Load-time validation. Also clamps the resolver's per-attempt timeout
    /// to the request deadline.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.random.source != "os" {
            return Err(ConfigError::Invalid(format!(
                "unknown random source: {}",
                self.random.source
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request_timeout must be positive".to_string(),
            ));
        }

        for name in self.claim_names() {
            if RESERVED_CLAIMS.contains(&name.as_str()) {
                return Err(ConfigError::ReservedClaim(name));
            }
        }

        if let Some(nonce) = &self.token.nonce {
            if nonce.bytes == 0 {
                return Err(ConfigError::Invalid(
                    "token.nonce.bytes must be positive".to_string(),
                ));
            }
        }
        for builder in &self.token.claims {
            match builder {
                BuilderConfig::Nonce { bytes: 0, claim } => {
                    return Err(ConfigError::Invalid(format!(
                        "nonce builder for claim {claim} must use a positive byte length"
                    )));
                }
                BuilderConfig::Remote {
                    template: Some(template),
                    ..
                } => {
                    crate::resolver::check_template(template).map_err(ConfigError::Invalid)?;
                }
                _ => {}
            }
        }

        let wants_remote = self
            .token
            .claims
            .iter()
            .any(|b| matches!(b, BuilderConfig::Remote { .. }));
        let request_timeout = self.request_timeout;
        match &mut self.token.remote {
            None if wants_remote => {
                return Err(ConfigError::Invalid(
                    "remote builders configured without token.remote".to_string(),
                ));
            }
            Some(remote) => {
                if wants_remote && remote.url.is_empty() {
                    return Err(ConfigError::Invalid(
                        "token.remote.url must be set".to_string(),
                    ));
                }
                if reqwest::Method::from_bytes(remote.method.as_bytes()).is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "token.remote.method is not an HTTP method: {}",
                        remote.method
                    )));
                }
                if let Some(path) = &remote.path {
                    if !path.is_empty() && !path.starts_with('/') {
                        return Err(ConfigError::Invalid(format!(
                            "token.remote.path must be a JSON pointer: {path}"
                        )));
                    }
                }
                if remote.retries.max_attempts == 0 {
                    return Err(ConfigError::Invalid(
                        "token.remote.retries.max_attempts must be positive".to_string(),
                    ));
                }
                crate::resolver::check_template(&remote.url).map_err(ConfigError::Invalid)?;
                if let Some(body) = &remote.body {
                    crate::resolver::check_template(body).map_err(ConfigError::Invalid)?;
                }
                if remote.timeout > request_timeout {
                    tracing::warn!(
                        remote_timeout = ?remote.timeout,
                        request_timeout = ?request_timeout,
                        "clamping resolver timeout to the request deadline"
                    );
                    remote.timeout = request_timeout;
                }
            }
            None => {}
        }

        if let Some(alg) = self.token.alg {
            let compatible = match self.key.family {
                KeyFamily::Rsa => matches!(alg, Alg::RS256 | Alg::RS384 | Alg::RS512),
                KeyFamily::Ec => match self.key.curve {
                    Curve::P256 => alg == Alg::ES256,
                    Curve::P384 => alg == Alg::ES384,
                    Curve::P521 => alg == Alg::ES512,
                },
                KeyFamily::Ed25519 => alg == Alg::EdDSA,
            };
            if !compatible {
                return Err(ConfigError::Invalid(format!(
                    "token.alg {} does not match the configured key type",
                    alg.as_str()
                )));
            }
        }

        if self.key.family == KeyFamily::Rsa && ![2048, 3072, 4096].contains(&self.key.bits) {
            return Err(ConfigError::Invalid(format!(
                "key.bits must be 2048, 3072, or 4096 (got {})",
                self.key.bits
            )));
        }

        Ok(())
    }

    /// Claim names produced by configured builders, shortcut builders
    /// included. Used for the reserved-name check.
    fn claim_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for builder in &self.token.claims {
            match builder {
                BuilderConfig::Static { claim, .. }
                | BuilderConfig::Header { claim, .. }
                | BuilderConfig::Parameter { claim, .. }
                | BuilderConfig::Variable { claim, .. }
                | BuilderConfig::Certificate { claim, .. }
                | BuilderConfig::Nonce { claim, .. }
                | BuilderConfig::Time { claim, .. }
                | BuilderConfig::Duration { claim } => names.push(claim.clone()),
                BuilderConfig::Remote { claim, .. } => {
                    if let Some(claim) = claim {
                        names.push(claim.clone());
                    }
                }
            }
        }
        if let Some(p) = &self.token.partner_id {
            names.push(p.claim.clone());
        }
        if let Some(n) = &self.token.nonce {
            names.push(n.claim.clone());
        }
        names
    }
}

/// Loads configuration from `banshee.{yaml,toml,json}` in the working
/// directory plus `BANSHEE_*` environment overrides, then validates it.
pub fn load() -> Result<Settings, ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name("banshee").required(false))
        .add_source(
            config::Environment::with_prefix("BANSHEE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let mut settings: Settings = cfg.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

/// Loads configuration from an in-memory YAML document; same validation as
/// [`load`].
#[cfg(test)]
pub fn from_yaml(text: &str) -> Result<Settings, ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::File::from_str(text, config::FileFormat::Yaml))
        .build()?;

    let mut settings: Settings = cfg.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let settings = from_yaml("{}").unwrap();
        assert!(settings.servers.issuer.is_none());
        assert!(settings.token.include_iat);
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.key.family, KeyFamily::Rsa);
        assert_eq!(settings.key.bits, 2048);
        assert_eq!(settings.request_id_header, "x-request-id");
    }

    #[test]
    fn builder_list_deserializes_in_order() {
        let settings = from_yaml(
            r#"
token:
  claims:
    - type: static
      claim: iss
      value: banshee
    - type: header
      claim: sub
      name: X-User
      required: true
    - type: time
      claim: iat
      kind: iat
"#,
        )
        .unwrap();

        assert_eq!(settings.token.claims.len(), 3);
        assert!(matches!(
            &settings.token.claims[0],
            BuilderConfig::Static { claim, .. } if claim == "iss"
        ));
        assert!(matches!(
            &settings.token.claims[1],
            BuilderConfig::Header { name, required: true, .. } if name == "X-User"
        ));
    }

    #[test]
    fn reserved_claim_is_rejected() {
        let err = from_yaml(
            r#"
token:
  claims:
    - type: static
      claim: alg
      value: none
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ReservedClaim(name) if name == "alg"));
    }

    #[test]
    fn zero_length_nonce_is_rejected() {
        let err = from_yaml(
            r#"
token:
  nonce:
    claim: jti
    bytes: 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn remote_builder_requires_resolver_wiring() {
        let err = from_yaml(
            r#"
token:
  claims:
    - type: remote
      claim: tier
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn resolver_timeout_is_clamped_to_request_deadline() {
        let settings = from_yaml(
            r#"
request_timeout: 2s
token:
  remote:
    url: http://partner.local/attributes
    timeout: 10s
"#,
        )
        .unwrap();
        assert_eq!(
            settings.token.remote.unwrap().timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn alg_key_mismatch_is_rejected() {
        let err = from_yaml(
            r#"
token:
  alg: ES256
key:
  type: rsa
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn curve_names_parse() {
        let settings = from_yaml(
            r#"
token:
  alg: ES384
key:
  type: ec
  curve: P-384
"#,
        )
        .unwrap();
        assert_eq!(settings.key.curve, Curve::P384);
    }

    #[test]
    fn settings_survive_reserialization() {
        let settings = from_yaml(
            r#"
request_timeout: 10s
token:
  duration: 1h
  nonce:
    claim: jti
    bytes: 16
  claims:
    - type: static
      claim: iss
      value: banshee
    - type: header
      claim: sub
      name: X-User
      required: true
    - type: time
      claim: iat
      kind: iat
"#,
        )
        .unwrap();

        let text = serde_json::to_string(&settings).unwrap();
        let reloaded: Settings = serde_json::from_str(&text).unwrap();

        assert_eq!(reloaded.request_timeout, settings.request_timeout);
        assert_eq!(reloaded.token.duration, settings.token.duration);
        assert_eq!(
            serde_json::to_value(&reloaded.token.claims).unwrap(),
            serde_json::to_value(&settings.token.claims).unwrap()
        );
    }

    #[test]
    fn server_sections_carry_headers() {
        let settings = from_yaml(
            r#"
servers:
  issuer:
    address: 127.0.0.1:6500
    headers:
      x-service: banshee
  key:
    address: 127.0.0.1:6502
    disabled: true
"#,
        )
        .unwrap();
        let issuer = settings.servers.issuer.unwrap();
        assert_eq!(issuer.headers.get("x-service").unwrap(), "banshee");
        assert!(settings.servers.key.unwrap().disabled);
    }
}
