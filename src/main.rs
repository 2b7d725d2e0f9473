use std::sync::Arc;

use axum::http::HeaderName;
use tokio::task::JoinSet;

mod claims;
mod config;
mod context;
mod error;
mod jwks;
mod key;
mod middleware;
mod random;
mod resolver;
mod server;
mod telemetry;
mod token;

use claims::BuilderSet;
use key::{KeySpec, KeyStore};
use resolver::Resolver;
use token::TokenFactory;

pub struct AppState {
    pub settings: config::Settings,
    pub keys: KeyStore,
    pub factory: TokenFactory,
    pub builders: BuilderSet,
    pub resolver: Option<Resolver>,
}

#[tokio::main]
async fn main() {
    // configuration is the leaf dependency: on failure there is no logger
    // yet, so report on stderr and exit with the startup failure code
    let settings = match config::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let _telemetry = telemetry::init(&settings.telemetry);

    if let Err(e) = run(settings).await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(2);
    }
}

async fn run(settings: config::Settings) -> anyhow::Result<()> {
    let request_id_header: HeaderName = settings.request_id_header.parse().map_err(|_| {
        anyhow::anyhow!(
            "request_id_header is not a header name: {}",
            settings.request_id_header
        )
    })?;

    let keys = KeyStore::new();
    let spec = KeySpec::from_config(&settings.key, settings.token.alg)?;
    let default_kid = match &settings.key.kid {
        Some(kid) => kid.clone(),
        None => random::key_id()?,
    };

    if let Some(file) = &settings.key.file {
        let pair = key::load_rsa_pem(&default_kid, file, settings.token.alg)?;
        keys.install(pair).await;
        tracing::info!(kid = %default_kid, file = %file.display(), "signing key loaded");
    }

    let factory = TokenFactory::new(keys.clone(), default_kid.clone(), spec);
    if settings.key.eager {
        factory.warm().await?;
        tracing::info!(kid = %default_kid, "default signing key ready");
    }

    let client = resolver::build_client(&settings.client)?;
    let resolver = settings
        .token
        .remote
        .clone()
        .filter(|remote| !remote.url.is_empty())
        .map(|remote| Resolver::new(remote, client));
    let builders = BuilderSet::from_config(&settings.token);

    if settings.servers.metrics.is_some() || settings.servers.pprof.is_some() {
        tracing::warn!("metrics/pprof server sections are recognized but not served");
    }

    let state = Arc::new(AppState {
        settings,
        keys,
        factory,
        builders,
        resolver,
    });

    let endpoints = [
        (
            "issuer",
            state.settings.servers.issuer.clone(),
            server::issuer_router(state.clone()),
        ),
        (
            "claims",
            state.settings.servers.claims.clone(),
            server::claims_router(state.clone()),
        ),
        (
            "key",
            state.settings.servers.key.clone(),
            server::key_router(state.clone()),
        ),
        ("health", state.settings.servers.health.clone(), server::health_router()),
    ];

    let mut servers = JoinSet::new();
    for (name, cfg, router) in endpoints {
        let Some(cfg) = cfg else { continue };
        if cfg.disabled {
            tracing::info!(server = name, "server disabled");
            continue;
        }
        let header = request_id_header.clone();
        servers.spawn(async move { server::run(name, cfg, router, header).await });
    }

    if servers.is_empty() {
        anyhow::bail!("no servers enabled");
    }

    while let Some(result) = servers.join_next().await {
        result??;
    }
    Ok(())
}
