use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::{AckOrder, RejoinPolicy, RunnerOptions};
use common_telemetry::OtelConfig;
use envconfig::Envconfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    // Handle first, then mark: redelivers instead of dropping on a crash
    #[envconfig(default = "false")]
    pub process_before_mark: bool,

    #[envconfig(default = "250")]
    pub rejoin_initial_interval_ms: u64,

    #[envconfig(default = "10000")]
    pub rejoin_maximum_interval_ms: u64,

    // Unset: keep rejoining for as long as the process runs
    pub rejoin_max_failures: Option<u32>,

    #[envconfig(default = "true")]
    pub rejoin_stop_on_fatal: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub otel: OtelConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            ack_order: if self.process_before_mark {
                AckOrder::ProcessThenMark
            } else {
                AckOrder::MarkThenProcess
            },
            rejoin: RejoinPolicy {
                initial_interval: Duration::from_millis(self.rejoin_initial_interval_ms),
                maximum_interval: Duration::from_millis(self.rejoin_maximum_interval_ms),
                max_consecutive_failures: self.rejoin_max_failures,
                stop_on_fatal: self.rejoin_stop_on_fatal,
                ..RejoinPolicy::default()
            },
        }
    }
}
