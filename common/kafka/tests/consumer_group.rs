use std::sync::Arc;
use std::time::Duration;

use common_kafka::{
    AckOrder, ConsumerGroupRunner, ConsumerService, GroupError, ReadinessGate, RejoinPolicy,
    RunnerOptions,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod common;
use common::*;

fn fast_rejoin() -> RejoinPolicy {
    RejoinPolicy {
        initial_interval: Duration::from_millis(1),
        maximum_interval: Duration::from_millis(5),
        ..RejoinPolicy::default()
    }
}

struct Harness {
    log: EventLog,
    control: GroupControl,
    shutdown: CancellationToken,
    ready: ReadinessGate,
    runner: JoinHandle<Result<(), GroupError>>,
}

fn start(options: RunnerOptions, handler_delay: Duration) -> Harness {
    let log = EventLog::default();
    let (client, control) = FakeGroupClient::new(log.clone());
    let handler = RecordingHandler::slow(log.clone(), handler_delay);
    let runner = ConsumerGroupRunner::new(client, vec![TOPIC.to_owned()], handler, options);

    let shutdown = CancellationToken::new();
    let ready = ReadinessGate::new();
    let runner = tokio::spawn(runner.run(shutdown.clone(), ready.clone()));
    Harness {
        log,
        control,
        shutdown,
        ready,
        runner,
    }
}

fn start_default() -> Harness {
    start(
        RunnerOptions {
            rejoin: fast_rejoin(),
            ..RunnerOptions::default()
        },
        Duration::ZERO,
    )
}

#[tokio::test]
async fn malformed_message_does_not_stop_the_partition() {
    let harness = start_default();
    let session = harness.control.assign(&[0]);

    session.send(0, inbound(0, 0, "1")).await;
    session.send(0, inbound(0, 1, "{not json")).await;
    session.send(0, inbound(0, 2, "")).await;
    session.send(0, inbound(0, 3, "4")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handled:") == 2).await;
    eventually(|| log.count("marked:") == 4).await;
    assert!(log.position("handled:0").is_some());
    assert!(log.position("handled:3").is_some());

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn marks_before_processing_by_default() {
    let harness = start_default();
    let session = harness.control.assign(&[0]);
    session.send(0, inbound(0, 10, "6")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handled:") == 1).await;
    assert!(log.position("marked:10") < log.position("handled:10"));

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn process_then_mark_inverts_the_order() {
    let harness = start(
        RunnerOptions {
            ack_order: AckOrder::ProcessThenMark,
            rejoin: fast_rejoin(),
        },
        Duration::ZERO,
    );
    let session = harness.control.assign(&[0]);
    session.send(0, inbound(0, 10, "6")).await;
    session.send(0, inbound(0, 11, "nope")).await;

    let log = harness.log.clone();
    eventually(|| log.count("marked:") == 2).await;
    assert!(log.position("handled:10") < log.position("marked:10"));
    // Failed messages are still marked
    assert!(log.position("marked:11").is_some());

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn revoked_session_stops_claim_loops_promptly() {
    let harness = start_default();
    let session = harness.control.assign(&[0, 1]);
    session.send(0, inbound(0, 0, "1")).await;
    session.send(1, inbound(1, 0, "2")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handled:") == 2).await;

    session.revoke();
    for claim in &session.claims {
        tokio::time::timeout(Duration::from_secs(1), claim.closed())
            .await
            .expect("claim loop still running after revoke");
    }

    // Nothing was handled after the revoke
    assert!(session.claims[0].send(inbound(0, 1, "3")).await.is_err());
    assert_eq!(log.count("handled:"), 2);
    assert!(!harness.runner.is_finished());

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejoins_after_rebalance() {
    let harness = start_default();
    let first = harness.control.assign(&[0]);
    first.send(0, inbound(0, 0, "1")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handled:") == 1).await;
    first.revoke();

    let second = harness.control.assign(&[1]);
    second.send(0, inbound(1, 7, "2")).await;
    eventually(|| log.count("handled:") == 2).await;

    assert_eq!(log.count("joined:"), 2);
    assert!(log.position("joined:2") < log.position("handled:7"));
    assert!(!harness.runner.is_finished());
    assert_eq!(log.count("closed:"), 0);

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn empty_assignment_waits_for_the_next_rebalance() {
    let harness = start_default();
    let idle = harness.control.assign(&[]);

    let log = harness.log.clone();
    eventually(|| log.count("joined:") == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(log.count("joined:"), 1);

    idle.revoke();
    let active = harness.control.assign(&[0]);
    active.send(0, inbound(0, 0, "1")).await;
    eventually(|| log.count("handled:") == 1).await;

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn closed_group_returns_without_rejoining() {
    let harness = start_default();
    let session = harness.control.assign(&[0]);
    let log = harness.log.clone();
    eventually(|| log.count("joined:") == 1).await;

    session.revoke();
    harness.control.fail(GroupError::Closed);

    let result = tokio::time::timeout(Duration::from_secs(1), harness.runner)
        .await
        .expect("runner did not return");
    assert_eq!(result.unwrap(), Ok(()));
    assert_eq!(log.count("joined:"), 1);
    // Already closed underneath the runner
    assert_eq!(log.count("closed:"), 0);
}

#[tokio::test]
async fn transient_join_errors_are_retried() {
    let harness = start_default();
    harness
        .control
        .fail(GroupError::Connection("broker down".to_owned()));
    harness
        .control
        .fail(GroupError::Protocol("coordinator moved".to_owned()));
    let session = harness.control.assign(&[0]);
    session.send(0, inbound(0, 0, "1")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handled:") == 1).await;
    assert_eq!(log.count("join-failed:"), 2);
    assert!(harness.ready.is_open());

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn fatal_errors_stop_the_runner() {
    let harness = start_default();
    harness
        .control
        .fail(GroupError::Fatal("SASL authentication failed".to_owned()));

    let result = harness.runner.await.unwrap();
    assert!(matches!(result, Err(GroupError::Fatal(_))));
    assert_eq!(harness.log.count("closed:"), 1);
    assert!(!harness.ready.is_open());
}

#[tokio::test]
async fn fatal_errors_can_be_retried() {
    let harness = start(
        RunnerOptions {
            rejoin: RejoinPolicy {
                stop_on_fatal: false,
                ..fast_rejoin()
            },
            ..RunnerOptions::default()
        },
        Duration::ZERO,
    );
    harness
        .control
        .fail(GroupError::Fatal("SASL authentication failed".to_owned()));
    harness.control.assign(&[0]);

    let ready = harness.ready.clone();
    eventually(|| ready.is_open()).await;

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn gives_up_after_max_consecutive_failures() {
    let harness = start(
        RunnerOptions {
            rejoin: RejoinPolicy {
                max_consecutive_failures: Some(2),
                ..fast_rejoin()
            },
            ..RunnerOptions::default()
        },
        Duration::ZERO,
    );
    for _ in 0..2 {
        harness
            .control
            .fail(GroupError::Connection("broker down".to_owned()));
    }

    let result = harness.runner.await.unwrap();
    assert!(matches!(
        result,
        Err(GroupError::RejoinExhausted { attempts: 2, .. })
    ));
}

#[tokio::test]
async fn readiness_opens_on_first_join_only() {
    let harness = start_default();
    assert!(!harness.ready.is_open());

    let first = harness.control.assign(&[0]);
    harness.ready.wait().await;
    assert!(harness.ready.is_open());

    first.revoke();
    let second = harness.control.assign(&[0]);
    second.send(0, inbound(0, 0, "1")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handled:") == 1).await;
    assert_eq!(log.count("joined:"), 2);
    assert!(harness.ready.is_open());

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_drains_claims_before_closing() {
    let harness = start(
        RunnerOptions {
            rejoin: fast_rejoin(),
            ..RunnerOptions::default()
        },
        Duration::from_millis(100),
    );
    let session = harness.control.assign(&[0, 1]);
    session.send(0, inbound(0, 0, "1")).await;

    let log = harness.log.clone();
    eventually(|| log.count("handling:") == 1).await;
    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();

    let closed = log
        .position("closed:open_claims=0")
        .expect("client closed with claim loops still running");
    assert!(log.position("handled:0").expect("in-flight message finished") < closed);
    assert_eq!(log.count("closed:"), 1);
    assert_eq!(log.events().last().map(String::as_str), Some("closed:open_claims=0"));
}

#[tokio::test]
async fn shutdown_while_joining_still_closes_once() {
    let harness = start_default();
    tokio::time::sleep(Duration::from_millis(10)).await;

    harness.shutdown.cancel();
    harness.runner.await.unwrap().unwrap();
    assert_eq!(harness.log.events(), vec!["closed:open_claims=0"]);
}

#[tokio::test]
async fn service_drains_on_signal() {
    let log = EventLog::default();
    let (client, control) = FakeGroupClient::new(log.clone());
    let runner = ConsumerGroupRunner::new(
        client,
        vec![TOPIC.to_owned()],
        RecordingHandler::new(log.clone()),
        RunnerOptions::default(),
    );
    let service = ConsumerService::new(runner);
    let ready = service.readiness();

    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(service.run(CancellationToken::new(), async move {
        signal_rx.await.ok();
    }));

    let session = control.assign(&[0]);
    ready.wait().await;
    session.send(0, inbound(0, 0, "1")).await;
    eventually(|| log.count("handled:") == 1).await;

    signal_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
    assert_eq!(log.count("closed:open_claims=0"), 1);
}

#[tokio::test]
async fn service_stops_on_signal_while_joining() {
    let log = EventLog::default();
    let (client, _control) = FakeGroupClient::new(log.clone());
    let runner = ConsumerGroupRunner::new(
        client,
        vec![TOPIC.to_owned()],
        RecordingHandler::new(log.clone()),
        RunnerOptions::default(),
    );
    let service = ConsumerService::new(runner);
    let ready = service.readiness();

    // Nothing is ever assigned, the signal has already fired
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        service.run(CancellationToken::new(), async {}),
    )
    .await
    .expect("service stopped while joining");

    assert_eq!(result, Ok(()));
    assert!(!ready.is_open());
    assert_eq!(log.events(), vec!["closed:open_claims=0"]);
}

#[tokio::test]
async fn service_returns_when_the_group_is_closed_before_joining() {
    let log = EventLog::default();
    let (client, control) = FakeGroupClient::new(log.clone());
    let runner = ConsumerGroupRunner::new(
        client,
        vec![TOPIC.to_owned()],
        Arc::new(|_: &common_kafka::InboundMessage| Ok::<(), common_kafka::DecodeError>(())),
        RunnerOptions::default(),
    );
    let service = ConsumerService::new(runner);
    let ready = service.readiness();

    control.fail(GroupError::Closed);
    let result = service
        .run(CancellationToken::new(), futures::future::pending())
        .await;
    assert_eq!(result, Ok(()));
    assert!(!ready.is_open());
}

#[tokio::test]
async fn service_stops_when_the_caller_cancels() {
    let log = EventLog::default();
    let (client, control) = FakeGroupClient::new(log.clone());
    let runner = ConsumerGroupRunner::new(
        client,
        vec![TOPIC.to_owned()],
        RecordingHandler::new(log.clone()),
        RunnerOptions::default(),
    );
    let service = ConsumerService::new(runner);
    let cancel = CancellationToken::new();
    let running = tokio::spawn(service.run(cancel.clone(), futures::future::pending()));

    control.assign(&[0]);
    eventually(|| log.count("joined:") == 1).await;
    cancel.cancel();

    running.await.unwrap().unwrap();
    assert_eq!(log.count("closed:"), 1);
}
