//! 竞速建连的时序性质，全部在暂停时钟下运行。

mod common;

use std::time::Duration;

use common::{A, B, Harness, settle};
use spark_taps::test_stubs::{MockStack, Script};
use spark_taps::{ConnectionState, EstablishmentConfig, EventKind, TapsError};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn early_winner_prevents_second_dial() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.script(A, Script::succeed_after(50));
    harness.stack.script(B, Script::succeed_after(10));

    let connection = harness.context.initiate(harness.specifier()).expect("initiate");
    assert_eq!(connection.state(), ConnectionState::Initiating);

    harness.handler.wait_for(EventKind::Ready, 1).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(harness.handler.count(EventKind::Ready), 1);
    assert_eq!(harness.stack.dials(), vec![A]);
    assert_eq!(connection.state(), ConnectionState::Established);
    let path = connection.path().expect("path");
    assert_eq!(path.remote.map(|r| r.addr), Some(A));
}

#[tokio::test(start_paused = true)]
async fn failure_starts_next_candidate_immediately() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.script(A, Script::refuse_after(20));
    harness.stack.script(B, Script::succeed_after(150));

    let started = Instant::now();
    let connection = harness.context.initiate(harness.specifier()).expect("initiate");
    harness.handler.wait_for(EventKind::Ready, 1).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(170), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
    assert_eq!(harness.stack.dials(), vec![A, B]);
    assert_eq!(
        connection.path().and_then(|p| p.remote).map(|r| r.addr),
        Some(B)
    );

    settle().await;
    assert_eq!(harness.handler.kinds(), vec![EventKind::Ready]);
}

#[tokio::test(start_paused = true)]
async fn losing_attempt_is_cancelled() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.script(A, Script::succeed_after(150));
    harness.stack.script(B, Script::Hang);

    let _connection = harness.context.initiate(harness.specifier()).expect("initiate");
    harness.handler.wait_for(EventKind::Ready, 1).await;
    settle().await;

    assert_eq!(harness.stack.dials(), vec![A, B]);
    assert_eq!(harness.stack.cancellations(), vec![B]);
    assert_eq!(harness.stack.flows().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_winner_flow_is_destroyed() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.script(A, Script::succeed_after(200));
    harness.stack.script(B, Script::succeed_after(20));

    let _connection = harness.context.initiate(harness.specifier()).expect("initiate");
    harness.handler.wait_for(EventKind::Ready, 1).await;
    settle().await;

    // B 在 120ms 胜出；A 被取消，不会留下存活的数据流。
    assert_eq!(harness.stack.cancellations(), vec![A]);
    let flows = harness.stack.flows();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].0, B);
    assert!(!flows[0].1.is_destroyed());
}

#[tokio::test(start_paused = true)]
async fn all_candidates_failing_is_reported_as_event() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.fallback(Script::refuse_after(10));

    let connection = harness.context.initiate(harness.specifier()).expect("initiate");
    harness.handler.wait_for(EventKind::Error, 1).await;
    settle().await;

    assert_eq!(connection.state(), ConnectionState::Failed);
    assert_eq!(harness.handler.count(EventKind::Ready), 0);
    assert_eq!(harness.handler.count(EventKind::Closed), 0);
    match harness.connection_errors().as_slice() {
        [TapsError::AllCandidatesFailed { failures }] => assert_eq!(failures.len(), 2),
        other => panic!("unexpected errors: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn establishment_timeout_cancels_in_flight_attempts() {
    let config = common::racing_config().with_establishment_timeout(Duration::from_secs(1));
    let harness = Harness::with_config(MockStack::reliable("tcp", 1), config);
    harness.stack.fallback(Script::Hang);

    let connection = harness.context.initiate(harness.specifier()).expect("initiate");
    harness.handler.wait_for(EventKind::Error, 1).await;
    settle().await;

    assert_eq!(connection.state(), ConnectionState::Failed);
    match harness.connection_errors().as_slice() {
        [TapsError::EstablishmentTimeout { attempts, elapsed }] => {
            assert_eq!(*attempts, 2);
            assert!(*elapsed >= Duration::from_secs(1));
        }
        other => panic!("unexpected errors: {other:?}"),
    }
    let mut cancelled = harness.stack.cancellations();
    cancelled.sort();
    assert_eq!(cancelled, vec![A, B]);
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_defers_attempts() {
    let config = common::racing_config().with_max_concurrent_attempts(1);
    let harness = Harness::with_config(MockStack::reliable("tcp", 1), config);
    harness.stack.script(A, Script::refuse_after(300));
    harness.stack.script(B, Script::succeed_after(10));

    let started = Instant::now();
    let _connection = harness.context.initiate(harness.specifier()).expect("initiate");
    harness.handler.wait_for(EventKind::Ready, 1).await;

    // 名额被 A 占满，B 只能在 A 失败后启动。
    assert!(started.elapsed() >= Duration::from_millis(310));
    assert_eq!(harness.stack.dials(), vec![A, B]);
}

#[tokio::test(start_paused = true)]
async fn untrusted_peer_fails_the_attempt() {
    use spark_taps::parameters::SecurityMetadata;

    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let security = harness
        .context
        .new_security_parameters()
        .verify_trust_with(|_: &SecurityMetadata| Ok::<_, TapsError>(false));
    let specifier = spark_taps::CandidateSpecifier::new(
        common::remote(),
        harness.context.new_transport_parameters(),
        security,
    );

    let _connection = harness.context.initiate(specifier).expect("initiate");
    harness.handler.wait_for(EventKind::Error, 1).await;

    match harness.connection_errors().as_slice() {
        [TapsError::AllCandidatesFailed { failures }] => {
            assert!(failures.iter().all(|f| matches!(
                f.error,
                spark_taps::StackError::TrustVerificationFailed { .. }
            )));
        }
        other => panic!("unexpected errors: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unsatisfiable_path_requirement_fails_without_io() {
    use spark_taps::parameters::InterfaceKind;

    let harness = Harness::with_config(MockStack::reliable("tcp", 1), EstablishmentConfig::default());
    let transport = harness
        .context
        .new_transport_parameters()
        .require_value(spark_taps::ParameterId::InterfaceType, InterfaceKind::Cellular);
    let specifier = spark_taps::CandidateSpecifier::new(
        common::remote(),
        transport,
        harness.context.new_security_parameters(),
    );

    let _connection = harness.context.initiate(specifier).expect("initiate");
    harness.handler.wait_for(EventKind::Error, 1).await;

    assert!(harness.stack.dials().is_empty());
    assert!(matches!(
        harness.connection_errors().as_slice(),
        [TapsError::NoViableCandidates { .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn unknown_host_is_an_asynchronous_resolution_failure() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let specifier = spark_taps::CandidateSpecifier::new(
        spark_taps::RemoteSpecifier::new()
            .with_hostname("nowhere.invalid")
            .with_port(80),
        harness.context.new_transport_parameters(),
        harness.context.new_security_parameters(),
    );

    let connection = harness.context.initiate(specifier).expect("sync part succeeds");
    harness.handler.wait_for(EventKind::Error, 1).await;

    assert_eq!(connection.state(), ConnectionState::Failed);
    assert!(matches!(
        harness.connection_errors().as_slice(),
        [TapsError::ResolutionFailure { .. }]
    ));
}
