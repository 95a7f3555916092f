//! Concurrent breaches must coalesce into one incident per key
//!
//! These tests run on the multi-threaded runtime so candidates for the same
//! key really race each other.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use grove_monitor::{
    Operator, Severity,
    evaluation::AlertCandidate,
    incident::Transition,
    metrics,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_concurrent_failures_open_one_incident() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let fleet = Arc::new(Fleet::new(Some(&server.uri())).await);

    let tasks = (0..3).map(|_| {
        let fleet = fleet.clone();
        tokio::spawn(async move { fleet.ingest(health("grove-domain-tool", false, Utc::now())).await })
    });
    let results: Vec<Vec<Transition>> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let opened = results
        .iter()
        .flatten()
        .filter(|t| matches!(t, Transition::Opened(_)))
        .count();
    let coalesced = results
        .iter()
        .flatten()
        .filter(|t| matches!(t, Transition::Coalesced { .. }))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(coalesced, 2);

    assert_eq!(fleet.incidents_open().await.len(), 1);

    fleet.incidents.settle().await;
    assert_eq!(fleet.incidents.notification_counts().dispatched, 1);
    server.verify().await;
}

fn candidate(service: &str, metric_type: &str, severity: Severity, value: f64) -> AlertCandidate {
    AlertCandidate {
        service_name: service.to_string(),
        metric_type: metric_type.to_string(),
        severity,
        current_value: value,
        threshold_value: 1.0,
        operator: Operator::Gt,
        webhook_url: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_at_most_one_open_incident_per_key_under_load() {
    let fleet = Arc::new(Fleet::new(None).await);
    let keys = [
        ("groveauth", metrics::ERROR_RATE),
        ("groveauth", metrics::LATENCY_P95),
        ("scout", metrics::ERROR_RATE),
        ("autumnsgrove", metrics::HEALTH_CHECK),
    ];

    let tasks = (0..200).map(|i| {
        let fleet = fleet.clone();
        let (service, metric_type) = keys[i % keys.len()];
        let severity = if i % 3 == 0 {
            Severity::Critical
        } else {
            Severity::Warning
        };
        tokio::spawn(async move {
            fleet
                .incidents
                .handle_candidate(candidate(service, metric_type, severity, i as f64))
                .await
                .unwrap()
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    let open = fleet.incidents_open().await;
    assert_eq!(open.len(), keys.len());

    let mut per_key: HashMap<(String, String), usize> = HashMap::new();
    for incident in &open {
        *per_key
            .entry((incident.service_name.clone(), incident.title.clone()))
            .or_default() += 1;
        // Some critical candidate arrived for every key
        assert_eq!(incident.severity, Severity::Critical);
    }
    assert!(per_key.values().all(|&count| count == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_breach_and_recovery_leave_consistent_state() {
    let fleet = Arc::new(Fleet::new(None).await);

    let tasks = (0..100).map(|i| {
        let fleet = fleet.clone();
        tokio::spawn(async move {
            let value = if i % 2 == 0 { 25.0 } else { 0.5 };
            fleet
                .ingest(metric("scout", metrics::ERROR_RATE, value, Utc::now()))
                .await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert!(fleet.incidents_open().await.len() <= 1);

    // A final recovery always ends with nothing open
    fleet
        .ingest(metric("scout", metrics::ERROR_RATE, 0.1, Utc::now()))
        .await;
    assert!(fleet.incidents_open().await.is_empty());
}
