pub mod config;
pub mod consumer_group;
pub mod context;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod message;
pub mod propagation;
pub mod publisher;
pub mod readiness;
pub mod service;

pub use consumer_group::{
    AckOrder, ConsumerGroupRunner, DecodeError, GroupClient, GroupError, MessageHandler,
    OffsetMarker, PartitionClaim, RejoinPolicy, RunnerOptions, Session,
};
pub use context::{CallContext, Done};
pub use kafka_producer::{KafkaMessageProducer, MessageProducer, PendingAck, ProduceError};
pub use message::{AckResult, InboundMessage, MessageHeaders, OutboundMessage};
pub use propagation::TracePropagator;
pub use publisher::{KeyStrategy, PublishError, Publisher};
pub use readiness::{GateError, ReadinessGate};
pub use service::{start_consumer_group, ConsumerService};

pub const DICE_ROLLS_TOPIC: &str = "dice_rolls";
