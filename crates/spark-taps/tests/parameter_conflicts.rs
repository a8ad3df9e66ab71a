//! 同步失败面：参数冲突、形状错误与格式错误的描述。

mod common;

use std::time::Duration;

use common::Harness;
use proptest::prelude::*;
use proptest::sample::select;
use spark_taps::parameters::{
    CapacityProfile, EnumKind, InterfaceKind, ParameterGroup, SchedulerKind, ValueShape,
};
use spark_taps::test_stubs::MockStack;
use spark_taps::{
    CandidateSpecifier, ErrorCategory, ParameterId, ParameterSet, ParameterValue, RemoteSpecifier,
    TapsError,
};

fn value_for(id: ParameterId) -> ParameterValue {
    match id.shape() {
        ValueShape::Boolean => ParameterValue::Boolean(true),
        ValueShape::Integer => ParameterValue::Integer(1200),
        ValueShape::Duration => ParameterValue::Duration(Duration::from_secs(3)),
        ValueShape::Enum(EnumKind::Interface) => ParameterValue::Interface(InterfaceKind::Wired),
        ValueShape::Enum(EnumKind::Capacity) => ParameterValue::Capacity(CapacityProfile::Default),
        ValueShape::Enum(EnumKind::Scheduler) => ParameterValue::Scheduler(SchedulerKind::Fifo),
    }
}

fn wrong_value_for(id: ParameterId) -> ParameterValue {
    match id.shape() {
        ValueShape::Boolean => ParameterValue::Duration(Duration::from_millis(1)),
        _ => ParameterValue::Boolean(false),
    }
}

fn empty_set_for(id: ParameterId) -> ParameterSet {
    match id.group() {
        ParameterGroup::Transport => ParameterSet::transport(),
        ParameterGroup::Security => ParameterSet::security(),
    }
}

proptest! {
    #[test]
    fn require_then_prohibit_always_conflicts(id in select(ParameterId::ALL.to_vec())) {
        let value = value_for(id);
        let err = empty_set_for(id)
            .require_value(id, value.clone())
            .prohibit_value(id, value)
            .finalize()
            .unwrap_err();
        prop_assert!(
            matches!(err, TapsError::ConfigurationConflict { parameter, .. } if parameter == id),
            "unexpected error {err:?}"
        );
        prop_assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn soft_preferences_never_conflict(
        id in select(ParameterId::ALL.to_vec()),
        prefer_first in any::<bool>(),
    ) {
        let set = empty_set_for(id);
        let set = if prefer_first {
            set.prefer(id).avoid(id)
        } else {
            set.avoid(id).prefer(id).ignore(id)
        };
        prop_assert!(set.finalize().is_ok());
    }

    #[test]
    fn mismatched_shapes_are_rejected_by_set(id in select(ParameterId::ALL.to_vec())) {
        let err = empty_set_for(id).set(id, wrong_value_for(id)).unwrap_err();
        prop_assert_eq!(err.code(), "spark.taps.invalid_parameter_value");
    }
}

#[test]
fn parameters_of_the_other_group_are_rejected() {
    let err = ParameterSet::transport()
        .require(ParameterId::Ciphersuite)
        .finalize()
        .unwrap_err();
    assert!(matches!(err, TapsError::InvalidParameterValue { parameter: ParameterId::Ciphersuite, .. }));
}

#[tokio::test]
async fn call_level_override_cannot_relax_a_requirement() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let specifier = CandidateSpecifier::new(
        common::remote(),
        harness.context.new_transport_parameters().require(ParameterId::FullyReliable),
        harness.context.new_security_parameters(),
    );
    let preconnection = harness.context.preconnect(vec![specifier]);

    let err = preconnection
        .initiate_with(&ParameterSet::transport().prohibit(ParameterId::FullyReliable))
        .unwrap_err();
    assert!(matches!(err, TapsError::ConfigurationConflict { parameter: ParameterId::FullyReliable, .. }));
    assert!(harness.stack.dials().is_empty());
}

#[tokio::test]
async fn context_defaults_are_the_widest_layer() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    harness
        .context
        .set_transport_defaults(ParameterSet::transport().prohibit(ParameterId::OrderPreserved))
        .expect("defaults are self-consistent");
    let specifier = CandidateSpecifier::new(
        common::remote(),
        harness.context.new_transport_parameters().require(ParameterId::OrderPreserved),
        harness.context.new_security_parameters(),
    );

    let err = harness.context.initiate(specifier).unwrap_err();
    assert_eq!(err.code(), "spark.taps.configuration_conflict");
}

#[tokio::test]
async fn stack_level_requirement_nobody_offers_fails_synchronously() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));
    let specifier = CandidateSpecifier::new(
        common::remote(),
        harness.context.new_transport_parameters().require(ParameterId::Multistreaming),
        harness.context.new_security_parameters(),
    );

    let err = harness.context.initiate(specifier).unwrap_err();
    assert!(matches!(err, TapsError::NoViableCandidates { .. }));
    assert!(harness.stack.dials().is_empty());
}

#[tokio::test]
async fn malformed_specifiers_fail_synchronously() {
    let harness = Harness::new(MockStack::reliable("tcp", 1));

    let empty = harness.context.preconnect(Vec::new());
    assert!(matches!(empty.initiate(), Err(TapsError::MalformedSpecifier { .. })));

    let portless = CandidateSpecifier::new(
        RemoteSpecifier::new().with_hostname(common::HOST),
        harness.context.new_transport_parameters(),
        harness.context.new_security_parameters(),
    );
    assert!(matches!(
        harness.context.initiate(portless),
        Err(TapsError::MalformedSpecifier { .. })
    ));

    let nameless = CandidateSpecifier::new(
        RemoteSpecifier::new().with_port(443),
        harness.context.new_transport_parameters(),
        harness.context.new_security_parameters(),
    );
    assert!(matches!(
        harness.context.initiate(nameless),
        Err(TapsError::MalformedSpecifier { .. })
    ));
}
