//! Fleet status derivation over realistic sample histories

use chrono::Utc;
use grove_monitor::{
    ServiceStatus, Severity,
    cache::{ActiveIncidents, CacheKey, SystemOverview, get_entry},
    evaluation::{Evaluation, evaluate},
    incident::Transition,
    metrics,
};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_stale_service_is_unknown() {
    let fleet = Fleet::new(None).await;

    for service in ["groveauth", "grove-domain-tool", "autumnsgrove"] {
        fleet.ingest(health(service, true, minutes_ago(1))).await;
    }
    // Last check older than the ten minute horizon
    fleet.ingest(health("scout", true, minutes_ago(45))).await;

    let snapshot = fleet.aggregator.compute(Utc::now()).await.unwrap();
    let scout = snapshot
        .services
        .iter()
        .find(|s| s.status.service == "scout")
        .unwrap();

    assert_eq!(scout.status.status, ServiceStatus::Unknown);
    assert_eq!(snapshot.overview.unknown_services, 1);
    assert_eq!(snapshot.overview.healthy_services, 3);
}

#[tokio::test]
async fn test_error_rate_above_both_thresholds_is_one_critical_candidate() {
    let fleet = Fleet::new(None).await;
    let thresholds = fleet.thresholds().await;

    let evaluation = evaluate(&thresholds, "groveauth", metrics::ERROR_RATE, 12.0);
    let Evaluation::Matched(candidate) = evaluation else {
        panic!("expected a match, got {evaluation:?}");
    };
    assert_eq!(candidate.severity, Severity::Critical);
    assert_eq!(candidate.threshold_value, 10.0);

    fleet.ingest(health("groveauth", true, Utc::now())).await;
    let transitions = fleet
        .ingest(metric("groveauth", metrics::ERROR_RATE, 12.0, Utc::now()))
        .await;
    let opened: Vec<_> = transitions
        .iter()
        .filter(|t| matches!(t, Transition::Opened(_)))
        .collect();
    assert_eq!(opened.len(), 1);

    let open = fleet.incidents_open().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, Severity::Critical);
    assert_eq!(open[0].service_name, "groveauth");

    let snapshot = fleet.aggregator.compute(Utc::now()).await.unwrap();
    let groveauth = snapshot
        .services
        .iter()
        .find(|s| s.status.service == "groveauth")
        .unwrap();
    assert_eq!(groveauth.status.status, ServiceStatus::Degraded);
    assert_eq!(snapshot.overview.active_incidents, 1);
}

#[tokio::test]
async fn test_failing_health_check_is_down() {
    let fleet = Fleet::new(None).await;
    fleet
        .ingest(health("grove-domain-tool", false, Utc::now()))
        .await;

    let snapshot = fleet.aggregator.compute(Utc::now()).await.unwrap();
    let status = snapshot
        .services
        .iter()
        .find(|s| s.status.service == "grove-domain-tool")
        .map(|s| s.status.status);
    assert_eq!(status, Some(ServiceStatus::Down));
}

#[tokio::test]
async fn test_rebuild_matches_live_derivation() {
    let fleet = Fleet::new(None).await;
    let now = Utc::now();

    fleet.ingest(health("groveauth", true, minutes_ago(2))).await;
    fleet
        .ingest(metric("groveauth", metrics::ERROR_RATE, 7.5, minutes_ago(2)))
        .await;
    fleet
        .ingest(metric("groveauth", metrics::REQUESTS, 4200.0, minutes_ago(2)))
        .await;
    fleet.ingest(health("scout", false, minutes_ago(1))).await;
    fleet.ingest(health("autumnsgrove", true, minutes_ago(3))).await;

    let live = fleet.aggregator.compute(now).await.unwrap();
    fleet.aggregator.publish(&live).await;

    // A fresh process over the same store
    let restarted = Fleet::with_store(None, fleet.store.clone()).await;
    let rebuilt = restarted.aggregator.rebuild(now).await.unwrap();
    assert_eq!(rebuilt, live);

    let overview: SystemOverview = get_entry(restarted.cache.as_ref(), &CacheKey::SystemOverview)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(overview, live.overview);

    let active: ActiveIncidents = get_entry(restarted.cache.as_ref(), &CacheKey::ActiveIncidents)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.incidents.len(), 2);
}
