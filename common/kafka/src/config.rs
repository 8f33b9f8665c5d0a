use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "100000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before librdkafka stops retrying a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

impl KafkaConfig {
    /// Connection settings only, with the producer defaults. Used when brokers
    /// are handed over as a plain string instead of being read from the env.
    pub fn for_hosts(hosts: &str) -> Self {
        Self {
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_producer_queue_messages: 100_000,
            kafka_message_timeout_ms: 20_000,
            kafka_compression_codec: "none".to_owned(),
            kafka_tls: false,
            kafka_hosts: hosts.to_owned(),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    // Comma separated, the group subscribes to every listed topic
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Marked offsets are committed in the background at this interval
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    #[envconfig(default = "45000")]
    pub kafka_consumer_session_timeout_ms: u32,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we can't set
    /// good defaults in the derive macro, so services set them here before
    /// loading their main config struct.
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }

    pub fn new(group_id: &str, topics: &[String]) -> Self {
        Self {
            kafka_consumer_group: group_id.to_owned(),
            kafka_consumer_topic: topics.join(","),
            kafka_consumer_offset_reset: "earliest".to_owned(),
            kafka_consumer_auto_commit_interval_ms: 5000,
            kafka_consumer_session_timeout_ms: 45000,
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.kafka_consumer_topic
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect()
    }
}
