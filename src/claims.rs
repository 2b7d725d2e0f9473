//! Claim assembly.
//!
//! Evaluates the configured builder list against a request context to
//! produce the claim map that becomes the JWT payload. Builders run in
//! configuration order with the shortcut builders (partner id, nonce,
//! lifetime, not-before delta) appended afterwards; on key collision the
//! later write wins. A final normalization pass converts duration strings,
//! forces time claims to integer seconds, and auto-inserts `iat`.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::{
    BuilderConfig, NonceConfig, PartnerIdConfig, TimeKind, TokenConfig, RESERVED_CLAIMS,
};
use crate::context::RequestContext;
use crate::error::Error;
use crate::random;
use crate::resolver::{ResolveError, Resolver};

/// Ordered claim map; insertion order is serialization order.
pub type ClaimMap = Map<String, Value>;

/// The compiled builder list for this process.
pub struct BuilderSet {
    builders: Vec<BuilderConfig>,
    partner: Option<PartnerIdConfig>,
    nonce: Option<NonceConfig>,
    lifetime: Option<Duration>,
    not_before_delta: Option<Duration>,
    /// Claims rewritten from duration strings in the post-builder pass.
    rewrites: Vec<String>,
    include_iat: bool,
    variables: HashMap<String, Value>,
}

impl BuilderSet {
    pub fn from_config(token: &TokenConfig) -> Self {
        let mut builders = Vec::new();
        let mut rewrites = Vec::new();
        for builder in &token.claims {
            match builder {
                BuilderConfig::Duration { claim } => rewrites.push(claim.clone()),
                other => builders.push(other.clone()),
            }
        }

        Self {
            builders,
            partner: token.partner_id.clone(),
            nonce: token.nonce.clone(),
            lifetime: token.duration,
            not_before_delta: token.not_before_delta,
            rewrites,
            include_iat: token.include_iat,
            variables: token.variables.clone(),
        }
    }

    /// Evaluates every builder against `ctx`, sequentially and in order.
    /// `now` is the request's wall-clock reading in seconds since the epoch.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        now: u64,
        resolver: Option<&Resolver>,
    ) -> Result<ClaimMap, Error> {
        let mut claims = ClaimMap::new();

        for builder in &self.builders {
            self.apply(builder, ctx, now, resolver, &mut claims).await?;
        }
        self.apply_shortcuts(ctx, now, &mut claims)?;
        self.normalize(&mut claims, now)?;

        Ok(claims)
    }

    async fn apply(
        &self,
        builder: &BuilderConfig,
        ctx: &RequestContext,
        now: u64,
        resolver: Option<&Resolver>,
        claims: &mut ClaimMap,
    ) -> Result<(), Error> {
        match builder {
            BuilderConfig::Static { claim, value } => {
                claims.insert(claim.clone(), value.clone());
            }
            BuilderConfig::Header {
                claim,
                name,
                required,
            } => match ctx.header(name) {
                Some(v) => {
                    claims.insert(claim.clone(), Value::String(v.to_string()));
                }
                None if *required => return Err(Error::MissingHeader(name.clone())),
                None => {}
            },
            BuilderConfig::Parameter {
                claim,
                name,
                required,
            } => match ctx.param(name) {
                Some(v) => {
                    claims.insert(claim.clone(), Value::String(v.to_string()));
                }
                None if *required => return Err(Error::MissingParameter(name.clone())),
                None => {}
            },
            BuilderConfig::Variable {
                claim,
                key,
                required,
            } => match self.variables.get(key) {
                Some(v) => {
                    claims.insert(claim.clone(), v.clone());
                }
                None if *required => return Err(Error::MissingVariable(key.clone())),
                None => {}
            },
            BuilderConfig::Certificate {
                claim,
                attr,
                required,
            } => match ctx.cert_attr(*attr) {
                Some(v) => {
                    claims.insert(claim.clone(), Value::String(v.to_string()));
                }
                None if *required => {
                    return Err(Error::MissingCertAttr(attr.as_str().to_string()))
                }
                None => {}
            },
            BuilderConfig::Nonce { claim, bytes } => {
                claims.insert(claim.clone(), Value::String(random::nonce(*bytes)?));
            }
            BuilderConfig::Time {
                claim,
                kind,
                duration,
            } => {
                let delta = duration.map(|d| d.as_secs()).unwrap_or(0);
                let value = match kind {
                    TimeKind::Iat => now,
                    TimeKind::Exp => now + delta,
                    TimeKind::Nbf => now.saturating_sub(delta),
                };
                claims.insert(claim.clone(), Value::from(value));
            }
            BuilderConfig::Remote {
                claim,
                template,
                optional,
            } => {
                let Some(resolver) = resolver else {
                    return Err(Error::Resolve(ResolveError::Unavailable(
                        "no resolver configured".to_string(),
                    )));
                };
                match resolver.resolve(template.as_deref(), ctx).await {
                    Ok(value) => insert_resolved(claims, claim.as_deref(), value, *optional)?,
                    Err(e) if *optional => {
                        tracing::debug!(error = %e, "optional remote claim omitted");
                    }
                    Err(e) => return Err(e),
                }
            }
            // extracted into `rewrites` at construction
            BuilderConfig::Duration { .. } => {}
        }
        Ok(())
    }

    fn apply_shortcuts(
        &self,
        ctx: &RequestContext,
        now: u64,
        claims: &mut ClaimMap,
    ) -> Result<(), Error> {
        if let Some(partner) = &self.partner {
            let value = ctx
                .header(&partner.header)
                .or_else(|| ctx.param(&partner.parameter))
                .map(str::to_string)
                .or_else(|| partner.default.clone());
            match value {
                Some(v) => {
                    claims.insert(partner.claim.clone(), Value::String(v));
                }
                None if partner.required => {
                    return Err(Error::MissingHeader(partner.header.clone()))
                }
                None => {}
            }
        }

        if let Some(nonce) = &self.nonce {
            claims.insert(nonce.claim.clone(), Value::String(random::nonce(nonce.bytes)?));
        }

        if let Some(lifetime) = self.lifetime {
            if !lifetime.is_zero() {
                claims.insert("exp".to_string(), Value::from(now + lifetime.as_secs()));
            }
        }

        if let Some(delta) = self.not_before_delta {
            claims.insert(
                "nbf".to_string(),
                Value::from(now.saturating_sub(delta.as_secs())),
            );
        }

        Ok(())
    }

    /// Post-builder pass: duration-string rewrites, integer time claims,
    /// auto-`iat`.
    fn normalize(&self, claims: &mut ClaimMap, now: u64) -> Result<(), Error> {
        for claim in &self.rewrites {
            rewrite_duration(claims, claim, now)?;
        }
        for claim in ["exp", "nbf", "iat"] {
            if matches!(claims.get(claim), Some(Value::String(_))) {
                rewrite_duration(claims, claim, now)?;
            }
            if let Some(Value::Number(n)) = claims.get(claim) {
                if !n.is_u64() && !n.is_i64() {
                    let truncated = n.as_f64().unwrap_or_default() as u64;
                    claims.insert(claim.to_string(), Value::from(truncated));
                }
            }
        }

        if self.include_iat && !claims.contains_key("iat") {
            claims.insert("iat".to_string(), Value::from(now));
        }

        Ok(())
    }
}

fn insert_resolved(
    claims: &mut ClaimMap,
    claim: Option<&str>,
    value: Value,
    optional: bool,
) -> Result<(), Error> {
    match claim {
        Some(claim) => {
            claims.insert(claim.to_string(), value);
        }
        None => match value {
            Value::Object(map) => {
                for (k, v) in map {
                    if RESERVED_CLAIMS.contains(&k.as_str()) {
                        tracing::warn!(claim = %k, "reserved claim from partner skipped");
                        continue;
                    }
                    claims.insert(k, v);
                }
            }
            other if optional => {
                tracing::debug!(value = %other, "non-object remote value omitted");
            }
            other => {
                return Err(Error::Resolve(ResolveError::Malformed(format!(
                    "expected an object to merge, got {other}"
                ))));
            }
        },
    }
    Ok(())
}

/// Converts a human-readable duration claim ("15m", "1h30m") into integer
/// seconds: `exp` becomes `now + d`, `nbf` becomes `now - d`, anything else
/// the bare second count.
fn rewrite_duration(claims: &mut ClaimMap, claim: &str, now: u64) -> Result<(), Error> {
    let Some(Value::String(text)) = claims.get(claim) else {
        return Ok(());
    };
    let duration = humantime::parse_duration(text)
        .map_err(|_| Error::InvalidDuration(claim.to_string()))?;
    let secs = duration.as_secs();

    let value = match claim {
        "exp" => now + secs,
        "nbf" => now.saturating_sub(secs),
        _ => secs,
    };
    claims.insert(claim.to_string(), Value::from(value));
    Ok(())
}
