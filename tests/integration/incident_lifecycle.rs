//! Incident lifecycle against a real webhook endpoint

use assert_matches::assert_matches;
use chrono::Utc;
use grove_monitor::{
    Severity,
    cache::{ActiveIncidents, CacheKey, get_entry},
    incident::{IncidentError, Transition},
    metrics,
    storage::SampleStore,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn webhook() -> MockServer {
    MockServer::start().await
}

#[tokio::test]
async fn test_resolution_clears_active_set_without_second_notification() {
    let server = webhook().await;
    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(body_partial_json(serde_json::json!({
            "type": "alert",
            "service": "scout",
            "metric": "error_rate",
            "severity": "warning",
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/alerts", server.uri());
    let fleet = Fleet::new(Some(&url)).await;

    let transitions = fleet
        .ingest(metric("scout", metrics::ERROR_RATE, 7.0, Utc::now()))
        .await;
    assert_matches!(transitions.as_slice(), [Transition::Opened(_)]);

    let active: ActiveIncidents = get_entry(fleet.cache.as_ref(), &CacheKey::ActiveIncidents)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.incidents.len(), 1);

    let transitions = fleet
        .ingest(metric("scout", metrics::ERROR_RATE, 1.5, Utc::now()))
        .await;
    assert_matches!(transitions.as_slice(), [Transition::Resolved(_)]);

    let active: ActiveIncidents = get_entry(fleet.cache.as_ref(), &CacheKey::ActiveIncidents)
        .await
        .unwrap()
        .unwrap();
    assert!(active.incidents.is_empty());

    fleet.incidents.settle().await;
    let counts = fleet.incidents.notification_counts();
    assert_eq!(counts.dispatched, 1);
    assert_eq!(counts.delivered, 1);

    server.verify().await;
}

#[tokio::test]
async fn test_resolved_at_never_precedes_triggered_at() {
    let fleet = Fleet::new(None).await;

    for _ in 0..5 {
        fleet.ingest(health("autumnsgrove", false, Utc::now())).await;
        let transitions = fleet.ingest(health("autumnsgrove", true, Utc::now())).await;

        let resolved = transitions
            .into_iter()
            .find_map(|t| match t {
                Transition::Resolved(incident) => Some(incident),
                _ => None,
            })
            .expect("recovery resolves the incident");

        assert!(resolved.resolved_at.unwrap() >= resolved.triggered_at);
    }

    assert!(fleet.incidents_open().await.is_empty());
}

#[tokio::test]
async fn test_breach_after_resolution_is_a_new_incident() {
    let fleet = Fleet::new(None).await;

    fleet
        .ingest(metric("groveauth", metrics::LATENCY_P95, 750.0, Utc::now()))
        .await;
    let first = fleet.incidents_open().await.remove(0);

    fleet
        .ingest(metric("groveauth", metrics::LATENCY_P95, 120.0, Utc::now()))
        .await;
    fleet
        .ingest(metric("groveauth", metrics::LATENCY_P95, 1400.0, Utc::now()))
        .await;

    let open = fleet.incidents_open().await;
    assert_eq!(open.len(), 1);
    assert_ne!(open[0].id, first.id);
    assert_eq!(open[0].severity, Severity::Critical);

    let old = fleet.store.get_incident(first.id).await.unwrap().unwrap();
    assert!(old.resolved_at.is_some());
}

#[tokio::test]
async fn test_escalation_keeps_incident_and_triggered_at() {
    let server = webhook().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let fleet = Fleet::new(Some(&server.uri())).await;

    fleet
        .ingest(metric("groveauth", metrics::ERROR_RATE, 6.0, Utc::now()))
        .await;
    let opened = fleet.incidents_open().await.remove(0);
    assert_eq!(opened.severity, Severity::Warning);

    let transitions = fleet
        .ingest(metric("groveauth", metrics::ERROR_RATE, 15.0, Utc::now()))
        .await;
    assert_matches!(
        transitions.as_slice(),
        [Transition::Coalesced { escalated: true, .. }]
    );

    let open = fleet.incidents_open().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, opened.id);
    assert_eq!(open[0].severity, Severity::Critical);
    assert_eq!(open[0].triggered_at, opened.triggered_at);

    fleet.incidents.settle().await;
    server.verify().await;
}

#[tokio::test]
async fn test_acknowledged_incident_stays_active() {
    let fleet = Fleet::new(None).await;
    fleet.ingest(health("scout", false, Utc::now())).await;
    let incident = fleet.incidents_open().await.remove(0);

    let acknowledged = fleet.incidents.acknowledge(incident.id, "autumn").await.unwrap();
    assert_eq!(acknowledged.acknowledged_by.as_deref(), Some("autumn"));

    // Still open, so repeated failures coalesce into it
    let transitions = fleet.ingest(health("scout", false, Utc::now())).await;
    assert_matches!(
        transitions.as_slice(),
        [Transition::Coalesced { escalated: false, .. }, ..]
    );

    fleet.ingest(health("scout", true, Utc::now())).await;
    assert!(fleet.incidents_open().await.is_empty());

    let result = fleet.incidents.acknowledge(incident.id, "autumn").await;
    assert_matches!(result, Err(IncidentError::AlreadyResolved(_)));
    let result = fleet.incidents.acknowledge(9_999, "autumn").await;
    assert_matches!(result, Err(IncidentError::UnknownIncident(9_999)));
}

#[tokio::test]
async fn test_failed_delivery_keeps_incident_open() {
    let server = webhook().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let fleet = Fleet::new(Some(&server.uri())).await;
    fleet.ingest(health("grove-domain-tool", false, Utc::now())).await;

    fleet.incidents.settle().await;

    let counts = fleet.incidents.notification_counts();
    assert_eq!(counts.dispatched, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(fleet.incidents_open().await.len(), 1);

    server.verify().await;
}
