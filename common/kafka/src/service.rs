use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::consumer_group::{ConsumerGroupRunner, GroupError, MessageHandler, RunnerOptions};
use crate::kafka_consumer::KafkaGroupClient;
use crate::readiness::ReadinessGate;

/// Joins `group_id` for `topics` on `brokers` and hands every message to
/// `handler`. Returns once `ctx` is cancelled (after draining and closing) or
/// the group is closed.
pub async fn start_consumer_group(
    ctx: CancellationToken,
    brokers: &str,
    group_id: &str,
    topics: &[String],
    handler: Arc<dyn MessageHandler>,
) -> Result<(), GroupError> {
    let kafka = KafkaConfig::for_hosts(brokers);
    let consumer = ConsumerConfig::new(group_id, topics);
    let client = KafkaGroupClient::new(&kafka, &consumer, None)?;

    ConsumerGroupRunner::new(Arc::new(client), topics.to_vec(), handler, RunnerOptions::default())
        .run(ctx, ReadinessGate::new())
        .await
}

/// Owns a runner for the lifetime of the process: starts it in the background,
/// waits until the group is joined, then until something asks it to stop.
pub struct ConsumerService {
    runner: ConsumerGroupRunner,
    ready: ReadinessGate,
}

impl ConsumerService {
    pub fn new(runner: ConsumerGroupRunner) -> Self {
        Self {
            runner,
            ready: ReadinessGate::new(),
        }
    }

    /// Shares the gate, for the readiness probe.
    pub fn readiness(&self) -> ReadinessGate {
        self.ready.clone()
    }

    /// Runs until `signal` resolves, `cancel` is cancelled, or the runner
    /// gives up. Shutdown always goes through the runner, so its claim loops
    /// are drained before the group client is closed.
    pub async fn run<S>(self, cancel: CancellationToken, signal: S) -> Result<(), GroupError>
    where
        S: Future<Output = ()> + Send,
    {
        let shutdown = cancel.child_token();
        let mut runner = tokio::spawn(self.runner.run(shutdown.clone(), self.ready.clone()));
        tokio::pin!(signal);

        tokio::select! {
            _ = self.ready.wait() => info!("consumer group ready"),
            _ = shutdown.cancelled() => {}
            _ = &mut signal => {
                info!("shutdown signal received before the consumer group joined");
                shutdown.cancel();
                return flatten(runner.await);
            }
            exited = &mut runner => return flatten(exited),
        }

        tokio::select! {
            _ = &mut signal => info!("shutdown signal received, draining consumer group"),
            _ = shutdown.cancelled() => info!("consumer service cancelled, draining consumer group"),
            exited = &mut runner => {
                let exited = flatten(exited);
                if let Err(error) = &exited {
                    error!("consumer group stopped: {}", error);
                }
                return exited;
            }
        }

        shutdown.cancel();
        flatten(runner.await)
    }
}

fn flatten(
    exited: Result<Result<(), GroupError>, tokio::task::JoinError>,
) -> Result<(), GroupError> {
    match exited {
        Ok(result) => result,
        Err(error) => {
            error!("consumer group runner panicked: {}", error);
            Err(GroupError::Fatal(error.to_string()))
        }
    }
}
