#![allow(dead_code)]
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common_kafka::kafka_producer::{Delivered, PendingAck};
use common_kafka::{
    DecodeError, GroupClient, GroupError, InboundMessage, MessageHandler, MessageHeaders,
    MessageProducer, OffsetMarker, OutboundMessage, PartitionClaim, ProduceError, Session,
};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const TOPIC: &str = "dice_rolls";

/// Shared, ordered record of what the fakes observed.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|logged| logged == event)
    }
}

/// Polls `condition` until it holds, panicking after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

pub fn inbound(partition: i32, offset: i64, value: &'static str) -> InboundMessage {
    InboundMessage {
        topic: TOPIC.to_owned(),
        partition,
        offset,
        key: Some(Bytes::from_static(b"test")),
        value: Bytes::from_static(value.as_bytes()),
        timestamp: Some(1_700_000_000_000),
        headers: MessageHeaders::new(),
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Reply {
    Ack { partition: i32, offset: i64 },
    Reject,
    QueueFull,
    Hang,
}

/// Producer answering every message the same scripted way.
pub struct FakeProducer {
    reply: Mutex<Reply>,
    submitted: Mutex<Vec<OutboundMessage>>,
    awaited: Arc<AtomicUsize>,
}

impl FakeProducer {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            submitted: Mutex::new(Vec::new()),
            awaited: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn submitted(&self) -> Vec<OutboundMessage> {
        self.submitted.lock().unwrap().clone()
    }

    /// How many acknowledgements were polled at least once.
    pub fn awaited(&self) -> usize {
        self.awaited.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageProducer for FakeProducer {
    async fn submit(&self, message: OutboundMessage) -> Result<PendingAck, ProduceError> {
        let reply = *self.reply.lock().unwrap();
        if let Reply::QueueFull = reply {
            return Err(ProduceError::QueueFull);
        }
        self.submitted.lock().unwrap().push(message);

        let awaited = self.awaited.clone();
        Ok(async move {
            awaited.fetch_add(1, Ordering::SeqCst);
            match reply {
                Reply::Ack { partition, offset } => Ok(Delivered { partition, offset }),
                Reply::Reject => Err(ProduceError::Rejected(
                    rdkafka::error::KafkaError::MessageProduction(
                        rdkafka::error::RDKafkaErrorCode::UnknownTopicOrPartition,
                    ),
                )),
                _ => futures::future::pending().await,
            }
        }
        .boxed())
    }
}

/// Handler that expects JSON integers and logs `handled:<offset>`.
pub struct RecordingHandler {
    log: EventLog,
    delay: Duration,
}

impl RecordingHandler {
    pub fn new(log: EventLog) -> Arc<Self> {
        Self::slow(log, Duration::ZERO)
    }

    /// Blocks the claim loop for `delay` on every message.
    pub fn slow(log: EventLog, delay: Duration) -> Arc<Self> {
        Arc::new(Self { log, delay })
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: &InboundMessage) -> Result<(), DecodeError> {
        if message.value.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        let _: i64 = serde_json::from_slice(&message.value).map_err(DecodeError::malformed)?;
        if !self.delay.is_zero() {
            self.log.push(format!("handling:{}", message.offset));
            std::thread::sleep(self.delay);
        }
        self.log.push(format!("handled:{}", message.offset));
        Ok(())
    }
}

struct RecordingMarker {
    log: EventLog,
}

impl OffsetMarker for RecordingMarker {
    fn mark(&self, message: &InboundMessage) -> Result<(), GroupError> {
        self.log.push(format!("marked:{}", message.offset));
        Ok(())
    }
}

enum Step {
    Assign {
        claims: Vec<(i32, mpsc::Receiver<InboundMessage>)>,
        revoke: CancellationToken,
    },
    Fail(GroupError),
}

/// Group client driven step by step from the test through a [`GroupControl`].
pub struct FakeGroupClient {
    steps: tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>,
    senders: Arc<Mutex<Vec<mpsc::Sender<InboundMessage>>>>,
    log: EventLog,
    generation: AtomicU64,
}

pub struct GroupControl {
    steps: mpsc::UnboundedSender<Step>,
    senders: Arc<Mutex<Vec<mpsc::Sender<InboundMessage>>>>,
}

/// One scripted assignment: feeds its claims and revokes it.
pub struct Assignment {
    pub claims: Vec<mpsc::Sender<InboundMessage>>,
    revoke: CancellationToken,
}

impl Assignment {
    pub async fn send(&self, claim: usize, message: InboundMessage) {
        self.claims[claim]
            .send(message)
            .await
            .expect("claim loop is gone");
    }

    /// Simulates the coordinator revoking the session.
    pub fn revoke(&self) {
        self.revoke.cancel();
    }
}

impl FakeGroupClient {
    pub fn new(log: EventLog) -> (Arc<Self>, GroupControl) {
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let senders = Arc::new(Mutex::new(Vec::new()));
        let client = Self {
            steps: tokio::sync::Mutex::new(steps_rx),
            senders: senders.clone(),
            log,
            generation: AtomicU64::new(0),
        };
        let control = GroupControl {
            steps: steps_tx,
            senders,
        };
        (Arc::new(client), control)
    }
}

impl GroupControl {
    pub fn assign(&self, partitions: &[i32]) -> Assignment {
        let mut claims = Vec::new();
        let mut senders = Vec::new();
        for partition in partitions {
            let (sender, receiver) = mpsc::channel(16);
            claims.push((*partition, receiver));
            senders.push(sender);
        }
        self.senders.lock().unwrap().extend(senders.iter().cloned());

        let revoke = CancellationToken::new();
        self.steps
            .send(Step::Assign {
                claims,
                revoke: revoke.clone(),
            })
            .expect("client dropped");
        Assignment {
            claims: senders,
            revoke,
        }
    }

    pub fn fail(&self, error: GroupError) {
        self.steps.send(Step::Fail(error)).expect("client dropped");
    }
}

#[async_trait]
impl GroupClient for FakeGroupClient {
    async fn next_session(
        &self,
        _topics: &[String],
        parent: &CancellationToken,
    ) -> Result<Session, GroupError> {
        let step = self.steps.lock().await.recv().await;
        match step {
            Some(Step::Assign { claims, revoke }) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.log.push(format!("joined:{generation}"));

                let session = parent.child_token();
                let watched = session.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = revoke.cancelled() => watched.cancel(),
                        _ = watched.cancelled() => {}
                    }
                });

                let claims = claims
                    .into_iter()
                    .map(|(partition, receiver)| PartitionClaim::new(TOPIC, partition, receiver))
                    .collect();
                let marker = Arc::new(RecordingMarker {
                    log: self.log.clone(),
                });
                Ok(Session::new(generation, session, marker, claims))
            }
            Some(Step::Fail(error)) => {
                self.log.push(format!("join-failed:{error}"));
                Err(error)
            }
            // Nothing scripted anymore: stay in the join phase
            None => futures::future::pending().await,
        }
    }

    async fn close(&self) -> Result<(), GroupError> {
        // Every claim loop dropped its receiver once it returned
        let open = self
            .senders
            .lock()
            .unwrap()
            .iter()
            .filter(|sender| !sender.is_closed())
            .count();
        self.log.push(format!("closed:open_claims={open}"));
        Ok(())
    }
}
