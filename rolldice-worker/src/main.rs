use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use common_kafka::config::ConsumerConfig;
use common_kafka::kafka_consumer::KafkaGroupClient;
use common_kafka::{ConsumerGroupRunner, ConsumerService, DICE_ROLLS_TOPIC};
use common_telemetry::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use common_telemetry::{init_tracing, shutdown_signal, shutdown_tracing, OtelConfig};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::Config;
use handler::DiceRollHandler;

mod app;
mod config;
mod handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ConsumerConfig::set_defaults("rolldice-worker", DICE_ROLLS_TOPIC);
    OtelConfig::set_defaults("rolldice-worker");
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    init_tracing(&config.otel)?;

    let liveness = HealthRegistry::new("liveness");
    let client = KafkaGroupClient::new(
        &config.kafka,
        &config.consumer,
        Some(liveness.register("rdkafka", Duration::from_secs(30))),
    )
    .context("failed to create kafka consumer")?;

    let runner = ConsumerGroupRunner::new(
        Arc::new(client),
        config.consumer.topics(),
        Arc::new(DiceRollHandler),
        config.runner_options(),
    );
    let service = ConsumerService::new(runner);

    let recorder = setup_metrics_recorder()?;
    let router = app::add_routes(Router::new(), service.readiness(), liveness);
    let router = setup_metrics_routes(router, recorder);

    // Probes stay up until the consumer group has drained
    let stop_http = CancellationToken::new();
    let bind = config.bind();
    let http = tokio::spawn({
        let stopped = stop_http.clone().cancelled_owned();
        async move { serve(router, &bind, stopped).await }
    });

    info!(
        group = %config.consumer.kafka_consumer_group,
        topics = %config.consumer.kafka_consumer_topic,
        "starting rolldice worker"
    );
    let consumed = service
        .run(CancellationToken::new(), shutdown_signal())
        .await;
    if let Err(e) = &consumed {
        error!("consumer group stopped: {}", e);
    }

    stop_http.cancel();
    if let Err(e) = http.await? {
        error!("failed to start rolldice-worker http server, {}", e);
    }

    shutdown_tracing();
    info!("Shutdown status change: COMPLETED");
    consumed.map_err(Into::into)
}
