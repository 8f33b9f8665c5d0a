use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use common_kafka::{KafkaMessageProducer, MessageProducer, Publisher};
use common_telemetry::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use common_telemetry::{init_tracing, shutdown_signal, shutdown_tracing, OtelConfig};
use envconfig::Envconfig;
use health::HealthRegistry;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use config::Config;

mod config;
mod handlers;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    OtelConfig::set_defaults("rolldice-api");
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    init_tracing(&config.otel)?;

    let liveness = HealthRegistry::new("liveness");
    let producer = KafkaMessageProducer::new(
        &config.kafka,
        liveness.register("rdkafka", Duration::from_secs(30)),
    )
    .await
    .context("failed to create kafka producer")?;
    let producer = Arc::new(producer);

    let state = handlers::AppState {
        publisher: Publisher::new(producer.clone(), &config.kafka_topic),
        publish_timeout: Duration::from_millis(config.publish_timeout_ms),
        liveness,
    };
    let recorder = setup_metrics_recorder()?;
    let app = setup_metrics_routes(handlers::add_routes(Router::new(), state), recorder)
        .layer(TraceLayer::new_for_http());

    info!(topic = %config.kafka_topic, "starting rolldice api");
    if let Err(e) = serve(app, &config.bind(), shutdown_signal()).await {
        error!("failed to start rolldice-api http server, {}", e);
    }

    // Deliver what is still queued before exiting
    info!("flushing kafka producer");
    let flushed = tokio::task::spawn_blocking(move || producer.flush(FLUSH_TIMEOUT)).await?;
    if let Err(e) = flushed {
        error!("failed to flush kafka producer: {}", e);
    }

    shutdown_tracing();
    info!("Shutdown status change: COMPLETED");
    Ok(())
}
