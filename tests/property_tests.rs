//! Property-based tests for threshold evaluation
//!
//! - Evaluation is a pure function of its inputs
//! - Snapshot order never changes the outcome
//! - The highest matching severity always wins
//! - Matched, Cleared and NotConfigured partition the inputs

use chrono::{TimeZone, Utc};
use grove_monitor::{
    Operator, Severity,
    evaluation::{Evaluation, evaluate},
    storage::{AlertThreshold, NewThreshold},
};
use proptest::prelude::*;

const SERVICE: &str = "groveauth";
const METRIC: &str = "error_rate";

fn operator() -> impl Strategy<Value = Operator> {
    prop_oneof![Just(Operator::Gt), Just(Operator::Lt), Just(Operator::Eq)]
}

fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Info),
        Just(Severity::Warning),
        Just(Severity::Critical)
    ]
}

/// Thresholds for one key, plus some for a neighbouring service
fn thresholds() -> impl Strategy<Value = Vec<AlertThreshold>> {
    prop::collection::vec(
        (
            operator(),
            (-50i32..50).prop_map(f64::from),
            severity(),
            any::<bool>(),
            prop::bool::weighted(0.8),
        ),
        0..12,
    )
    .prop_map(|rows| {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        rows.into_iter()
            .enumerate()
            .map(|(i, (operator, value, severity, enabled, same_service))| {
                NewThreshold {
                    service_name: if same_service { SERVICE } else { "scout" }.to_string(),
                    metric_type: METRIC.to_string(),
                    operator,
                    threshold_value: value,
                    severity,
                    enabled,
                    webhook_url: None,
                }
                .into_threshold(i as i64 + 1, at)
            })
            .collect()
    })
}

fn applicable(thresholds: &[AlertThreshold]) -> impl Iterator<Item = &AlertThreshold> {
    thresholds
        .iter()
        .filter(|t| t.enabled && t.service_name == SERVICE && t.metric_type == METRIC)
}

proptest! {
    #[test]
    fn prop_evaluation_is_deterministic(
        thresholds in thresholds(),
        value in (-60i32..60).prop_map(f64::from),
    ) {
        let first = evaluate(&thresholds, SERVICE, METRIC, value);
        let second = evaluate(&thresholds, SERVICE, METRIC, value);
        prop_assert_eq!(first, second);
    }
}

proptest! {
    #[test]
    fn prop_order_does_not_matter(
        (original, shuffled) in thresholds().prop_flat_map(|t| (Just(t.clone()), Just(t).prop_shuffle())),
        value in (-60i32..60).prop_map(f64::from),
    ) {
        prop_assert_eq!(
            evaluate(&original, SERVICE, METRIC, value),
            evaluate(&shuffled, SERVICE, METRIC, value)
        );
    }
}

proptest! {
    #[test]
    fn prop_highest_matching_severity_wins(
        thresholds in thresholds(),
        value in (-60i32..60).prop_map(f64::from),
    ) {
        let expected = applicable(&thresholds)
            .filter(|t| t.operator.apply(value, t.threshold_value))
            .map(|t| t.severity)
            .max();

        match evaluate(&thresholds, SERVICE, METRIC, value) {
            Evaluation::Matched(candidate) => {
                prop_assert_eq!(Some(candidate.severity), expected);
                prop_assert!(candidate.operator.apply(value, candidate.threshold_value));
            }
            other => prop_assert!(expected.is_none(), "expected a match, got {:?}", other),
        }
    }
}

proptest! {
    #[test]
    fn prop_outcome_partitions_inputs(
        thresholds in thresholds(),
        value in (-60i32..60).prop_map(f64::from),
    ) {
        let configured = applicable(&thresholds).count() > 0;
        let matching = applicable(&thresholds).any(|t| t.operator.apply(value, t.threshold_value));

        let outcome = evaluate(&thresholds, SERVICE, METRIC, value);
        match outcome {
            Evaluation::Matched(_) => prop_assert!(matching),
            Evaluation::Cleared { .. } => prop_assert!(configured && !matching),
            Evaluation::NotConfigured => prop_assert!(!configured),
        }
    }
}

proptest! {
    #[test]
    fn prop_other_services_are_never_evaluated(
        thresholds in thresholds(),
        value in (-60i32..60).prop_map(f64::from),
    ) {
        prop_assert_eq!(
            evaluate(&thresholds, "grove-domain-tool", METRIC, value),
            Evaluation::NotConfigured
        );
    }
}
