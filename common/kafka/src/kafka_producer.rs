use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use health::HealthHandle;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;
use crate::message::OutboundMessage;

/// Broker-side reasons a message was not written. Surfaced to the caller as
/// [`crate::message::AckResult::Failure`], never retried by this layer.
#[derive(Error, Debug, Clone)]
pub enum ProduceError {
    #[error("cannot reach kafka brokers: {0}")]
    Connection(KafkaError),
    #[error("producer queue is full")]
    QueueFull,
    #[error("message exceeds the maximum size")]
    MessageTooLarge,
    #[error("broker rejected the message: {0}")]
    Rejected(KafkaError),
    #[error("delivery report was dropped before the broker answered")]
    DeliveryCanceled,
}

impl ProduceError {
    pub fn from_kafka(error: KafkaError) -> Self {
        match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::QueueFull) => ProduceError::QueueFull,
            Some(RDKafkaErrorCode::MessageSizeTooLarge) => ProduceError::MessageTooLarge,
            Some(
                RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::Resolve,
            ) => ProduceError::Connection(error),
            _ => ProduceError::Rejected(error),
        }
    }
}

/// Where the broker wrote the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub partition: i32,
    pub offset: i64,
}

/// Resolves exactly once with the broker's answer for one submitted message.
pub type PendingAck = BoxFuture<'static, Result<Delivered, ProduceError>>;

/// The asynchronous send pipeline. `submit` returns once the client accepted
/// the message into its queue; the broker's answer arrives on the returned
/// future.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn submit(&self, message: OutboundMessage) -> Result<PendingAck, ProduceError>;

    fn flush(&self, _timeout: Duration) -> Result<(), ProduceError> {
        Ok(())
    }
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        metrics::gauge!("kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        for (_, broker) in stats.brokers {
            let id = broker.nodeid.to_string();
            metrics::gauge!("kafka_broker_requests_pending", "broker" => id.clone())
                .set(broker.outbuf_cnt as f64);
            metrics::counter!("kafka_broker_tx_errors_total", "broker" => id)
                .absolute(broker.txerrs);
        }
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// [`MessageProducer`] backed by an rdkafka `FutureProducer`.
#[derive(Clone)]
pub struct KafkaMessageProducer {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaMessageProducer {
    /// Fails with [`ProduceError::Connection`] when the brokers cannot be reached.
    pub async fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, ProduceError> {
        let producer = create_kafka_producer(config, liveness)
            .await
            .map_err(ProduceError::Connection)?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl MessageProducer for KafkaMessageProducer {
    async fn submit(&self, message: OutboundMessage) -> Result<PendingAck, ProduceError> {
        let headers = message.headers.to_kafka();
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.value[..])
            .headers(headers);
        if let Some(key) = message.key.as_ref() {
            record = record.key(&key[..]);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(error, _)| ProduceError::from_kafka(error))?;

        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(Delivered { partition, offset }),
                Ok(Err((error, _))) => Err(ProduceError::from_kafka(error)),
                // The producer dropped the delivery report, usually on shutdown
                Err(_) => Err(ProduceError::DeliveryCanceled),
            }
        }
        .boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        self.producer
            .flush(timeout)
            .map_err(ProduceError::from_kafka)
    }
}
