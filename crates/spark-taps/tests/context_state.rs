//! 上下文默认值与状态保存/恢复。

mod common;

use std::path::PathBuf;
use std::time::Duration;

use common::{A, Harness};
use spark_taps::test_stubs::{MockStack, Script};
use spark_taps::{
    EstablishmentConfig, EventKind, ParameterId, ParameterSet, Preference, SendParameters, TapsError,
};

fn scratch_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("spark-taps-{}-{name}.json", std::process::id()))
}

#[tokio::test]
async fn saved_state_restores_into_a_fresh_context() {
    let source = Harness::with_config(
        MockStack::reliable("tcp", 1),
        EstablishmentConfig::default()
            .with_stagger_delay(Duration::from_millis(40))
            .with_max_concurrent_attempts(3),
    );
    source
        .context
        .set_transport_defaults(
            ParameterSet::transport()
                .require(ParameterId::FullyReliable)
                .avoid(ParameterId::Multistreaming),
        )
        .expect("defaults");
    source
        .context
        .set_default_send_parameters(SendParameters::default().with_niceness(7));

    let path = scratch_file("round-trip");
    source.context.save(&path).expect("save");

    let target = Harness::new(MockStack::reliable("tcp", 1));
    target.context.restore(&path).expect("restore");
    let _ = std::fs::remove_file(&path);

    assert_eq!(target.context.config(), source.context.config());
    assert_eq!(target.context.state(), source.context.state());
    assert_eq!(target.context.default_send_parameters().niceness, 7);
    let restored = target.context.transport_defaults();
    assert_eq!(
        restored.dispositions(ParameterId::FullyReliable)[0].preference,
        Preference::Require
    );
}

#[tokio::test]
async fn garbage_blob_is_a_persistence_error() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let before = harness.context.state();

    let err = harness.context.restore_from(b"{not json").unwrap_err();
    assert!(matches!(err, TapsError::Persistence { .. }));
    assert_eq!(harness.context.state(), before);
}

#[tokio::test]
async fn missing_file_is_a_persistence_error() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let err = harness
        .context
        .restore(scratch_file("does-not-exist"))
        .unwrap_err();
    assert_eq!(err.code(), "spark.taps.persistence");
}

#[tokio::test]
async fn conflicting_defaults_are_refused() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let err = harness
        .context
        .set_transport_defaults(
            ParameterSet::transport()
                .require(ParameterId::OrderPreserved)
                .prohibit(ParameterId::OrderPreserved),
        )
        .unwrap_err();
    assert_eq!(err.code(), "spark.taps.configuration_conflict");
    assert!(harness.context.transport_defaults().is_empty());
}

#[tokio::test(start_paused = true)]
async fn preconnection_keeps_the_defaults_it_was_created_with() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness.stack.script(A, Script::succeed_after(0));
    let preconnection = harness.context.preconnect(vec![harness.specifier()]);

    // 之后的默认值要求一个没有协议栈提供的能力，但不影响已创建的预连接。
    harness
        .context
        .set_transport_defaults(ParameterSet::transport().require(ParameterId::Multistreaming))
        .expect("defaults");

    let connection = preconnection.initiate().expect("initiate");
    harness.handler.wait_for(EventKind::Ready, 1).await;
    assert!(connection.path().is_some());

    let later = harness.context.initiate(harness.specifier()).unwrap_err();
    assert!(matches!(later, TapsError::NoViableCandidates { .. }));
}

#[tokio::test]
async fn toml_configuration_is_validated() {
    let config = EstablishmentConfig::from_toml_str(
        "stagger_delay_ms = 50\nestablishment_timeout_ms = 2000\nmax_concurrent_attempts = 2\n",
    )
    .expect("valid toml");
    assert_eq!(config.stagger_delay, Duration::from_millis(50));
    assert_eq!(config.max_concurrent_attempts, 2);

    let err = EstablishmentConfig::from_toml_str("max_concurrent_attempts = 0").unwrap_err();
    assert!(matches!(err, TapsError::InvalidConfiguration { .. }));
}
