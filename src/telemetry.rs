//! Logging and tracing initialization.
//!
//! Installs an EnvFilter-driven fmt subscriber (JSON or pretty) and, when
//! `telemetry.otlp_enabled` is set, an OTLP span exporter. The returned
//! guard flushes exported spans on shutdown.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use tracing_subscriber::{
    fmt::format::FmtSpan,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LoggingFormat, TelemetryConfig};

pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}

/// RUST_LOG wins; otherwise per-section levels from the configuration.
fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let app = tracing::Level::from(config.level);
        let server = tracing::Level::from(config.axum_level);
        let client = tracing::Level::from(config.reqwest_level);
        EnvFilter::new(format!(
            "{app},axum={server},tower={server},reqwest={client},hyper={client}"
        ))
    })
}

fn otlp_provider(service_name: &str) -> SdkTracerProvider {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .expect("failed to build OTLP span exporter");

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name.to_string())
        .with_schema_url(
            [opentelemetry::KeyValue::new(
                opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            opentelemetry_semantic_conventions::SCHEMA_URL,
        )
        .build();

    SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            1.0,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build()
}

pub fn init(config: &TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = match config.format {
        LoggingFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_events(FmtSpan::NONE)
            .with_target(true)
            .boxed(),
        LoggingFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(fmt_layer);

    if !config.otlp_enabled {
        registry.init();
        return TelemetryGuard { provider: None };
    }

    let provider = otlp_provider(&config.service_name);
    let tracer = provider.tracer("banshee");
    registry
        .with(tracing_opentelemetry::OpenTelemetryLayer::new(tracer))
        .init();

    TelemetryGuard {
        provider: Some(provider),
    }
}
