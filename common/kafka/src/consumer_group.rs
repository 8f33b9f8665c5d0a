//! Consumer group membership and per-partition processing.
//!
//! A [`ConsumerGroupRunner`] repeatedly asks its [`GroupClient`] for a
//! [`Session`] (one generation of group membership), runs one processing loop
//! per [`PartitionClaim`] until the session is invalidated, and rejoins. It
//! only stops rejoining when the group is closed or shutdown is requested, in
//! which case every claim loop is joined before the client is closed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::message::InboundMessage;
use crate::propagation::TracePropagator;
use crate::readiness::ReadinessGate;

pub const CONSUMER_MESSAGES: &str = "kafka_consumer_messages_total";
pub const CONSUMER_DECODE_ERRORS: &str = "kafka_consumer_decode_errors_total";
pub const CONSUMER_MARK_ERRORS: &str = "kafka_consumer_mark_errors_total";
pub const CONSUMER_SESSIONS: &str = "kafka_consumer_sessions_total";
pub const CONSUMER_REJOIN_ERRORS: &str = "kafka_consumer_rejoin_errors_total";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("cannot reach kafka brokers: {0}")]
    Connection(String),
    #[error("consumer group protocol error: {0}")]
    Protocol(String),
    #[error("consumer group is closed")]
    Closed,
    #[error("unrecoverable consumer group error: {0}")]
    Fatal(String),
    #[error("gave up rejoining after {attempts} consecutive failures, last error: {last}")]
    RejoinExhausted { attempts: u32, last: Box<GroupError> },
}

impl GroupError {
    /// Errors that rejoining cannot fix, such as bad credentials or an
    /// invalid group configuration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GroupError::Fatal(_))
    }
}

/// The handler could not make sense of a message. Logged, never propagated.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has an empty payload")]
    EmptyPayload,
    #[error("malformed payload: {0}")]
    Malformed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DecodeError {
    pub fn malformed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        DecodeError::Malformed(Box::new(error))
    }
}

/// Application code run for every delivered message. Called at most once per
/// message per session; a failure never stops the claim loop.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage) -> Result<(), DecodeError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Result<(), DecodeError> + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) -> Result<(), DecodeError> {
        self(message)
    }
}

/// Records a message as consumed so its offset gets committed.
pub trait OffsetMarker: Send + Sync {
    fn mark(&self, message: &InboundMessage) -> Result<(), GroupError>;
}

/// One assigned partition for the lifetime of a session. Its stream is never
/// resumed once the session ends; the next session hands out a new claim.
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<InboundMessage>,
}

impl PartitionClaim {
    pub fn new(topic: impl Into<String>, partition: i32, messages: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next message routed to this partition, `None` once the client dropped
    /// the claim's sender.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.messages.recv().await
    }
}

/// One generation of group membership. `token` is cancelled by the client
/// when the coordinator revokes the assignment.
pub struct Session {
    generation: u64,
    token: CancellationToken,
    marker: Arc<dyn OffsetMarker>,
    claims: Vec<PartitionClaim>,
}

impl Session {
    pub fn new(
        generation: u64,
        token: CancellationToken,
        marker: Arc<dyn OffsetMarker>,
        claims: Vec<PartitionClaim>,
    ) -> Self {
        Self {
            generation,
            token,
            marker,
            claims,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn claims(&self) -> &[PartitionClaim] {
        &self.claims
    }

    pub fn claims_mut(&mut self) -> &mut [PartitionClaim] {
        &mut self.claims
    }

    pub fn marker(&self) -> &dyn OffsetMarker {
        self.marker.as_ref()
    }
}

#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Joins (or rejoins) the group and waits for the coordinator to grant an
    /// assignment. The session token must be a child of `parent`, so that
    /// cancelling `parent` also ends the session.
    async fn next_session(
        &self,
        topics: &[String],
        parent: &CancellationToken,
    ) -> Result<Session, GroupError>;

    /// Leaves the group and releases the connection. Called once, after every
    /// claim loop has returned.
    async fn close(&self) -> Result<(), GroupError>;
}

/// When a message is marked relative to running the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckOrder {
    /// At most once: a crash while handling loses the message.
    #[default]
    MarkThenProcess,
    /// At least once: a crash while handling redelivers the message.
    ProcessThenMark,
}

/// How failed join attempts are retried. Rejoining after a rebalance is not
/// a failure and is never delayed.
#[derive(Debug, Clone)]
pub struct RejoinPolicy {
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
    /// `None` keeps retrying for the whole process lifetime.
    pub max_consecutive_failures: Option<u32>,
    pub stop_on_fatal: bool,
}

impl Default for RejoinPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(250),
            maximum_interval: Duration::from_secs(10),
            max_consecutive_failures: None,
            stop_on_fatal: true,
        }
    }
}

impl RejoinPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        self.initial_interval
            .saturating_mul(factor)
            .min(self.maximum_interval)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub ack_order: AckOrder,
    pub rejoin: RejoinPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimExit {
    /// The session ended (rebalance or shutdown) while waiting for a message.
    SessionInvalidated,
    /// The claim's message stream was closed by the client.
    Exhausted,
}

pub struct ConsumerGroupRunner {
    client: Arc<dyn GroupClient>,
    topics: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    options: RunnerOptions,
    propagator: TracePropagator,
}

impl ConsumerGroupRunner {
    pub fn new(
        client: Arc<dyn GroupClient>,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            client,
            topics,
            handler,
            options,
            propagator: TracePropagator::default(),
        }
    }

    pub fn with_propagator(mut self, propagator: TracePropagator) -> Self {
        self.propagator = propagator;
        self
    }

    /// Runs until `shutdown` is cancelled or the group is closed. On shutdown,
    /// every claim loop has returned before the client is closed.
    pub async fn run(self, shutdown: CancellationToken, ready: ReadinessGate) -> Result<(), GroupError> {
        info!(topics = ?self.topics, "starting consumer group runner");

        let outcome = self.supervise(&shutdown, &ready).await;

        if let Err(GroupError::Closed) = outcome {
            // Closed underneath us, there is nothing left to release
            info!("consumer group closed, not rejoining");
            return Ok(());
        }

        info!("claim loops drained, closing consumer group client");
        let closed = self.client.close().await;
        match (outcome, closed) {
            (Err(error), _) => Err(error),
            (Ok(()), Err(error)) => {
                error!("failed to close consumer group client: {}", error);
                Err(error)
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn supervise(&self, shutdown: &CancellationToken, ready: &ReadinessGate) -> Result<(), GroupError> {
        let policy = &self.options.rejoin;
        let mut joined_once = false;
        let mut failures: u32 = 0;

        loop {
            let joined = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                joined = self.client.next_session(&self.topics, shutdown) => joined,
            };

            match joined {
                Ok(session) => {
                    failures = 0;
                    metrics::counter!(CONSUMER_SESSIONS).increment(1);
                    if !joined_once {
                        joined_once = true;
                        if let Err(error) = ready.open() {
                            error!("readiness gate opened outside of the runner: {}", error);
                        }
                        info!("consumer group joined, ready");
                    }

                    self.consume(session, shutdown).await;

                    if shutdown.is_cancelled() {
                        return Ok(());
                    }
                    info!("consumer group session ended, rejoining");
                }
                Err(GroupError::Closed) => return Err(GroupError::Closed),
                Err(error) if error.is_fatal() && policy.stop_on_fatal => {
                    error!("unrecoverable consumer group error: {}", error);
                    return Err(error);
                }
                Err(error) => {
                    failures += 1;
                    metrics::counter!(CONSUMER_REJOIN_ERRORS).increment(1);
                    if let Some(max) = policy.max_consecutive_failures {
                        if failures >= max {
                            error!("giving up on consumer group after {} failures: {}", failures, error);
                            return Err(GroupError::RejoinExhausted {
                                attempts: failures,
                                last: Box::new(error),
                            });
                        }
                    }

                    let delay = policy.backoff(failures - 1);
                    warn!(attempt = failures, ?delay, "failed to join consumer group: {}", error);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Runs every claim of the session and returns once all of them returned
    /// and the session is over.
    async fn consume(&self, session: Session, shutdown: &CancellationToken) {
        let Session {
            generation,
            token,
            marker,
            claims,
        } = session;
        info!(generation, claims = claims.len(), "consuming new session");

        let mut loops = JoinSet::new();
        for claim in claims {
            let span = info_span!(
                "claim",
                topic = %claim.topic,
                partition = claim.partition,
                generation
            );
            let worker = ClaimWorker {
                handler: self.handler.clone(),
                marker: marker.clone(),
                ack_order: self.options.ack_order,
                propagator: self.propagator.clone(),
                session: token.clone(),
                shutdown: shutdown.clone(),
            };
            loops.spawn(worker.run(claim).instrument(span));
        }

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(exit) => debug!(generation, ?exit, "claim loop returned"),
                Err(error) => error!(generation, "claim loop failed: {}", error),
            }
        }

        // Claims can run dry before the coordinator ends the session, and a
        // session may hold no claims at all: wait for the session to end
        // rather than spinning on rejoin.
        tokio::select! {
            _ = token.cancelled() => {}
            _ = shutdown.cancelled() => {}
        }
        token.cancel();
    }
}

struct ClaimWorker {
    handler: Arc<dyn MessageHandler>,
    marker: Arc<dyn OffsetMarker>,
    ack_order: AckOrder,
    propagator: TracePropagator,
    session: CancellationToken,
    shutdown: CancellationToken,
}

impl ClaimWorker {
    async fn run(self, mut claim: PartitionClaim) -> ClaimExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.session.cancelled() => return ClaimExit::SessionInvalidated,
                _ = self.shutdown.cancelled() => return ClaimExit::SessionInvalidated,
                message = claim.recv() => match message {
                    Some(message) => message,
                    None => return ClaimExit::Exhausted,
                },
            };
            self.process(&message);
        }
    }

    fn process(&self, message: &InboundMessage) {
        let span = info_span!(
            "process",
            otel.kind = "consumer",
            messaging.system = "kafka",
            messaging.operation = "process",
            messaging.source.name = %message.topic,
            messaging.kafka.partition = message.partition,
            messaging.kafka.offset = message.offset,
        );
        span.set_parent(self.propagator.extract(&message.headers));
        let _entered = span.enter();

        metrics::counter!(CONSUMER_MESSAGES, "topic" => message.topic.clone()).increment(1);
        debug!(timestamp = ?message.timestamp, "message claimed");

        match self.ack_order {
            AckOrder::MarkThenProcess => {
                self.mark(message);
                self.handle(message);
            }
            AckOrder::ProcessThenMark => {
                self.handle(message);
                self.mark(message);
            }
        }
    }

    fn mark(&self, message: &InboundMessage) {
        if let Err(error) = self.marker.mark(message) {
            metrics::counter!(CONSUMER_MARK_ERRORS).increment(1);
            warn!("failed to mark message as consumed: {}", error);
        }
    }

    fn handle(&self, message: &InboundMessage) {
        if let Err(error) = self.handler.handle(message) {
            metrics::counter!(CONSUMER_DECODE_ERRORS, "topic" => message.topic.clone())
                .increment(1);
            error!("failed to handle message: {}", error);
        }
    }
}
