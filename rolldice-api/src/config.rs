use common_kafka::config::KafkaConfig;
use common_telemetry::OtelConfig;
use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(default = "dice_rolls")]
    pub kafka_topic: String,

    // Upper bound on waiting for the broker's acknowledgement, per request
    #[envconfig(default = "5000")]
    pub publish_timeout_ms: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub otel: OtelConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
