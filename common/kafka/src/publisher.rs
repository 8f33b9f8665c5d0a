use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tracing::field::Empty;
use tracing::{error, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::context::{CallContext, Done};
use crate::kafka_producer::MessageProducer;
use crate::message::{AckResult, MessageHeaders, OutboundMessage};
use crate::propagation::TracePropagator;

pub const PUBLISH_ATTEMPTS: &str = "kafka_publish_attempts_total";
pub const PUBLISH_RESULTS: &str = "kafka_publish_results_total";
pub const PUBLISH_ACK_DURATION: &str = "kafka_publish_ack_duration_seconds";

/// The caller gave up before the broker answered. Whether the message reached
/// the broker is unknown once it was submitted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish cancelled by the caller")]
    Cancelled,
    #[error("publish deadline exceeded before the broker acknowledged")]
    DeadlineExceeded,
}

impl From<Done> for PublishError {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => PublishError::Cancelled,
            Done::DeadlineExceeded => PublishError::DeadlineExceeded,
        }
    }
}

/// How the partitioning key of a message is chosen.
#[derive(Clone)]
pub enum KeyStrategy {
    Fixed(Bytes),
    Derived(Arc<dyn Fn(&[u8]) -> Option<Bytes> + Send + Sync>),
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::Fixed(Bytes::from_static(b"test"))
    }
}

impl KeyStrategy {
    fn key_for(&self, payload: &[u8]) -> Option<Bytes> {
        match self {
            KeyStrategy::Fixed(key) => Some(key.clone()),
            KeyStrategy::Derived(derive) => derive(payload),
        }
    }
}

/// Publishes payloads to one topic and waits for the broker's answer.
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn MessageProducer>,
    topic: String,
    keys: KeyStrategy,
    propagator: TracePropagator,
}

impl Publisher {
    pub fn new(producer: Arc<dyn MessageProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            keys: KeyStrategy::default(),
            propagator: TracePropagator::default(),
        }
    }

    pub fn with_key_strategy(mut self, keys: KeyStrategy) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_propagator(mut self, propagator: TracePropagator) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Sends `payload` and waits, bounded by `ctx`, for the acknowledgement.
    ///
    /// Broker failures come back as `Ok(AckResult::Failure)`; `Err` is reserved
    /// for the caller's own cancellation or deadline.
    pub async fn publish(&self, ctx: &CallContext, payload: Bytes) -> Result<AckResult, PublishError> {
        metrics::counter!(PUBLISH_ATTEMPTS, "topic" => self.topic.clone()).increment(1);

        let span = info_span!(
            "publish",
            otel.name = %format!("{} publish", self.topic),
            otel.kind = "producer",
            otel.status_code = Empty,
            messaging.system = "kafka",
            messaging.operation = "publish",
            messaging.destination.name = %self.topic,
            messaging.kafka.partition = Empty,
            messaging.kafka.offset = Empty,
            messaging.publish.duration_ms = Empty,
            error.message = Empty,
        );

        // The span is dropped, and therefore ended, on every return path
        let result = self.publish_in_span(ctx, payload, &span).instrument(span.clone()).await;

        let outcome = match &result {
            Ok(AckResult::Success { .. }) => "success",
            Ok(AckResult::Failure { .. }) => "failure",
            Err(PublishError::Cancelled) => "cancelled",
            Err(PublishError::DeadlineExceeded) => "timeout",
        };
        metrics::counter!(PUBLISH_RESULTS, "topic" => self.topic.clone(), "result" => outcome)
            .increment(1);
        result
    }

    async fn publish_in_span(
        &self,
        ctx: &CallContext,
        payload: Bytes,
        span: &Span,
    ) -> Result<AckResult, PublishError> {
        if let Some(done) = ctx.is_done() {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", "caller context already done");
            return Err(done.into());
        }

        let mut headers = MessageHeaders::new();
        self.propagator.inject(&span.context(), &mut headers);

        let message = OutboundMessage {
            topic: self.topic.clone(),
            key: self.keys.key_for(&payload),
            value: payload,
            headers,
        };

        let start = Instant::now();
        let submitted = tokio::select! {
            biased;
            done = ctx.done() => {
                warn!(topic = %self.topic, "publish aborted before submission");
                span.record("otel.status_code", "ERROR");
                return Err(done.into());
            }
            submitted = self.producer.submit(message) => submitted,
        };

        let pending = match submitted {
            Ok(pending) => pending,
            Err(error) => {
                let duration = start.elapsed();
                error!(topic = %self.topic, "failed to submit message: {}", error);
                record_failure(span, &error.to_string(), duration);
                return Ok(AckResult::Failure { error, duration });
            }
        };

        let acked = tokio::select! {
            biased;
            done = ctx.done() => {
                // Already submitted: the broker may or may not get it
                warn!(topic = %self.topic, "publish abandoned while waiting for acknowledgement");
                span.record("otel.status_code", "ERROR");
                return Err(done.into());
            }
            acked = pending => acked,
        };

        let duration = start.elapsed();
        metrics::histogram!(PUBLISH_ACK_DURATION, "topic" => self.topic.clone())
            .record(duration.as_secs_f64());

        match acked {
            Ok(delivered) => {
                span.record("messaging.kafka.partition", delivered.partition);
                span.record("messaging.kafka.offset", delivered.offset);
                span.record("messaging.publish.duration_ms", duration.as_millis() as u64);
                span.record("otel.status_code", "OK");
                Ok(AckResult::Success {
                    partition: delivered.partition,
                    offset: delivered.offset,
                    duration,
                })
            }
            Err(error) => {
                error!(topic = %self.topic, "failed to produce to kafka: {}", error);
                record_failure(span, &error.to_string(), duration);
                Ok(AckResult::Failure { error, duration })
            }
        }
    }
}

fn record_failure(span: &Span, message: &str, duration: std::time::Duration) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", message);
    span.record("messaging.publish.duration_ms", duration.as_millis() as u64);
}
