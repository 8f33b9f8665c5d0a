use std::time::Duration;

use envconfig::Envconfig;
use opentelemetry::trace::TraceError;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("failed to build the OTLP tracer: {0}")]
    Tracer(#[from] TraceError),
    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Envconfig, Clone, Debug)]
pub struct OtelConfig {
    // Spans are only exported when set
    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub otel_log_level: Level,
}

impl OtelConfig {
    pub fn set_defaults(service_name: &str) {
        if std::env::var("OTEL_SERVICE_NAME").is_err() {
            std::env::set_var("OTEL_SERVICE_NAME", service_name);
        }
    }
}

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
}

/// Installs the global subscriber:
///   - stdout with a level configured by the RUST_LOG envvar (default=INFO)
///   - OpenTelemetry if `otel_url` is set, at `otel_log_level` and higher
///
/// Also installs the W3C trace context and baggage propagators for callers
/// that rely on the global propagator.
pub fn init_tracing(config: &OtelConfig) -> Result<(), TelemetryError> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );

    let otel_layer = config
        .otel_url
        .as_deref()
        .map(|url| init_tracer(url, config.otel_sampling_rate, &config.otel_service_name))
        .transpose()?
        .map(OpenTelemetryLayer::new)
        .with_filter(LevelFilter::from_level(config.otel_log_level));

    opentelemetry::global::set_text_map_propagator(
        opentelemetry::propagation::TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]),
    );

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

/// Flushes pending spans. Call once, after the servers stopped.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
