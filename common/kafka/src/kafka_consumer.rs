use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::consumer_group::{GroupClient, GroupError, OffsetMarker, PartitionClaim, Session};
use crate::message::InboundMessage;

// Messages buffered per claim before its partition is paused
const CLAIM_BUFFER: usize = 256;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Maps an rdkafka error onto the group error taxonomy. Credential and
/// configuration problems are fatal, rejoining will not fix them.
pub fn classify(error: KafkaError) -> GroupError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::Resolve
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::NetworkException,
        ) => GroupError::Connection(error.to_string()),
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::InvalidGroupId
            | RDKafkaErrorCode::InvalidConfig,
        ) => GroupError::Fatal(error.to_string()),
        _ => match error {
            KafkaError::ClientCreation(_) => GroupError::Fatal(error.to_string()),
            _ => GroupError::Protocol(error.to_string()),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Route {
    sender: mpsc::Sender<InboundMessage>,
    session: CancellationToken,
    overflow: Arc<Mutex<VecDeque<InboundMessage>>>,
}

type Routes = Mutex<HashMap<(String, i32), Route>>;

enum GroupEvent {
    Assigned {
        generation: u64,
        session: CancellationToken,
        claims: Vec<PartitionClaim>,
    },
    Failed(GroupError),
}

/// Turns rdkafka rebalance callbacks into sessions. The callbacks run on the
/// thread polling the consumer, so they only touch locks and channels.
pub struct GroupContext {
    liveness: Option<HealthHandle>,
    parent: Mutex<CancellationToken>,
    current: Mutex<Option<CancellationToken>>,
    routes: Arc<Routes>,
    events: mpsc::UnboundedSender<GroupEvent>,
    generation: AtomicU64,
}

impl GroupContext {
    fn invalidate_session(&self) {
        if let Some(session) = lock(&self.current).take() {
            session.cancel();
        }
        lock(&self.routes).clear();
    }
}

impl ClientContext for GroupContext {
    fn stats(&self, _stats: rdkafka::Statistics) {
        // The rdkafka main loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("revoking {} partitions", partitions.count());
                self.invalidate_session();

                // Commit what was marked so the next owner starts after it
                if partitions.count() > 0 {
                    match base_consumer.commit_consumer_state(CommitMode::Sync) {
                        Ok(()) => {}
                        Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                            debug!("nothing to commit on revoke")
                        }
                        Err(error) => warn!("failed to commit offsets on revoke: {}", error),
                    }
                }
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(error) => error!("rebalance error: {}", error),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Rebalance::Assign(partitions) = rebalance else {
            return;
        };

        let session = lock(&self.parent).child_token();
        let mut claims = Vec::with_capacity(partitions.count());
        {
            let mut routes = lock(&self.routes);
            routes.clear();
            for element in partitions.elements() {
                let (sender, receiver) = mpsc::channel(CLAIM_BUFFER);
                routes.insert(
                    (element.topic().to_owned(), element.partition()),
                    Route {
                        sender,
                        session: session.clone(),
                        overflow: Arc::default(),
                    },
                );
                claims.push(PartitionClaim::new(element.topic(), element.partition(), receiver));
            }
        }

        if let Some(previous) = lock(&self.current).replace(session.clone()) {
            previous.cancel();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "assigned {} partitions", claims.len());
        let event = GroupEvent::Assigned {
            generation,
            session,
            claims,
        };
        if self.events.send(event).is_err() {
            warn!("assignment dropped, consumer group client is gone");
        }
    }
}

type GroupConsumer = StreamConsumer<GroupContext>;

/// [`GroupClient`] backed by an rdkafka `StreamConsumer`.
///
/// A single pump task polls the consumer, which also drives the rebalance
/// callbacks, and routes each message to the channel of its partition claim.
/// Offsets are stored explicitly and committed in the background.
pub struct KafkaGroupClient {
    consumer: Arc<GroupConsumer>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupEvent>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    subscribed: AtomicBool,
    closed: AtomicBool,
}

impl KafkaGroupClient {
    /// Must be called from within a tokio runtime.
    pub fn new(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        liveness: Option<HealthHandle>,
    ) -> Result<Self, GroupError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &kafka.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer.kafka_consumer_group)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
            .set(
                "session.timeout.ms",
                consumer.kafka_consumer_session_timeout_ms.to_string(),
            );

        // Only marked messages get their offset stored
        client_config.set("enable.auto.offset.store", "false");

        if kafka.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            liveness,
            parent: Mutex::new(CancellationToken::new()),
            current: Mutex::new(None),
            routes: Arc::new(Mutex::new(HashMap::new())),
            events: events_tx.clone(),
            generation: AtomicU64::new(0),
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: GroupConsumer = client_config
            .create_with_context(context)
            .map_err(classify)?;
        let consumer = Arc::new(consumer);

        let stop = CancellationToken::new();
        let pump = tokio::spawn(pump(consumer.clone(), events_tx, stop.clone()));

        Ok(Self {
            consumer,
            events: tokio::sync::Mutex::new(events_rx),
            pump: Mutex::new(Some(pump)),
            stop,
            subscribed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), GroupError> {
        if self.subscribed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(classify)?;
        self.subscribed.store(true, Ordering::SeqCst);
        info!(?topics, "subscribed to topics");
        Ok(())
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn next_session(
        &self,
        topics: &[String],
        parent: &CancellationToken,
    ) -> Result<Session, GroupError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GroupError::Closed);
        }
        *lock(&self.consumer.context().parent) = parent.clone();
        self.subscribe(topics)?;

        let marker: Arc<dyn OffsetMarker> = Arc::new(KafkaOffsetMarker {
            consumer: Arc::downgrade(&self.consumer),
        });
        let mut events = self.events.lock().await;
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => return Err(GroupError::Closed),
                event = events.recv() => event.ok_or(GroupError::Closed)?,
            };
            match event {
                // Revoked before anyone picked it up
                GroupEvent::Assigned { session, .. } if session.is_cancelled() => continue,
                GroupEvent::Assigned {
                    generation,
                    session,
                    claims,
                } => return Ok(Session::new(generation, session, marker, claims)),
                GroupEvent::Failed(error) => return Err(error),
            }
        }
    }

    async fn close(&self) -> Result<(), GroupError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();
        self.consumer.context().invalidate_session();

        let pump = lock(&self.pump).take();
        if let Some(pump) = pump {
            if let Err(error) = pump.await {
                error!("consumer pump task failed: {}", error);
            }
        }

        let committed = match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(error) => {
                warn!("failed to commit offsets on close: {}", error);
                Err(classify(error))
            }
        };
        self.consumer.unsubscribe();
        info!("consumer group client closed");
        committed
    }
}

async fn pump(
    consumer: Arc<GroupConsumer>,
    events: mpsc::UnboundedSender<GroupEvent>,
    stop: CancellationToken,
) {
    let routes = consumer.context().routes.clone();
    loop {
        let received = tokio::select! {
            _ = stop.cancelled() => break,
            received = consumer.recv() => received,
        };

        let message = match received {
            Ok(borrowed) => InboundMessage::from_kafka(&borrowed),
            Err(error) => {
                let error = classify(error);
                if error.is_fatal() {
                    error!("consumer failed: {}", error);
                    consumer.context().invalidate_session();
                    if events.send(GroupEvent::Failed(error)).is_err() {
                        debug!("group closed before the failure was reported");
                    }
                } else {
                    warn!("error receiving from kafka: {}", error);
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => continue,
                }
            }
        };

        let route = lock(&routes)
            .get(&(message.topic.clone(), message.partition))
            .map(|route| (route.sender.clone(), route.session.clone(), route.overflow.clone()));
        let Some((sender, session, overflow)) = route else {
            // Not redelivered in this session, but the offset was never stored
            warn!(
                topic = %message.topic,
                partition = message.partition,
                "dropping message for a partition without a claim"
            );
            continue;
        };

        let mut parked = lock(&overflow);
        if !parked.is_empty() {
            // Behind messages still waiting for the claim loop
            parked.push_back(message);
            continue;
        }
        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => debug!("claim loop already returned, message dropped"),
            Err(TrySendError::Full(message)) => {
                let partition = partition_list(&message.topic, message.partition);
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    "claim is full, pausing partition"
                );
                if let Err(error) = consumer.pause(&partition) {
                    warn!("failed to pause partition: {}", error);
                }
                parked.push_back(message);
                drop(parked);
                tokio::spawn(forward_overflow(
                    consumer.clone(),
                    partition,
                    sender,
                    session,
                    overflow,
                ));
            }
        }
    }
    debug!("consumer pump stopped");
}

fn partition_list(topic: &str, partition: i32) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    list.add_partition(topic, partition);
    list
}

/// Hands parked messages to a full claim as it frees up, then resumes the
/// partition. The pump keeps polling meanwhile, so other partitions and the
/// rebalance callbacks are never held up by one slow claim.
async fn forward_overflow(
    consumer: Arc<GroupConsumer>,
    partition: TopicPartitionList,
    sender: mpsc::Sender<InboundMessage>,
    session: CancellationToken,
    overflow: Arc<Mutex<VecDeque<InboundMessage>>>,
) {
    loop {
        let permit = tokio::select! {
            _ = session.cancelled() => break,
            permit = sender.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let mut parked = lock(&overflow);
        match parked.pop_front() {
            Some(message) => permit.send(message),
            None => {
                // Resumed under the lock so the pump cannot overtake the backlog
                if let Err(error) = consumer.resume(&partition) {
                    warn!("failed to resume partition: {}", error);
                }
                return;
            }
        }
    }

    lock(&overflow).clear();
    if let Err(error) = consumer.resume(&partition) {
        debug!("failed to resume partition after the session ended: {}", error);
    }
}

struct KafkaOffsetMarker {
    consumer: Weak<GroupConsumer>,
}

impl OffsetMarker for KafkaOffsetMarker {
    fn mark(&self, message: &InboundMessage) -> Result<(), GroupError> {
        let consumer = self.consumer.upgrade().ok_or(GroupError::Closed)?;
        let mut offsets = TopicPartitionList::new();
        // The committed offset is the next one to read
        offsets
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .map_err(classify)?;
        consumer.store_offsets(&offsets).map_err(classify)
    }
}
