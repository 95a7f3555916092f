//! End-to-end: collectors, evaluator, incident manager and aggregator wired
//! together the way the binary does it

use std::sync::Arc;
use std::time::Duration;

use grove_monitor::{
    ServiceStatus,
    actors::{AggregatorHandle, CollectorHandle, CollectorSettings, EvaluatorHandle, SampleEvent},
    cache::{CacheKey, ServiceStatusEntry, get_entry},
    config::ServiceConfig,
    evaluation::StoreThresholdSource,
    liveness::Liveness,
    probes::HealthProbe,
};
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

fn service(name: &str, endpoint: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        endpoint: endpoint.to_string(),
        health_path: "/health".to_string(),
        interval: None,
        timeout: None,
        expected_status: vec![],
        body_pattern: None,
        metrics_url: None,
    }
}

fn settings() -> CollectorSettings {
    CollectorSettings {
        interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(10),
        ..CollectorSettings::default()
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_failing_service_flows_to_incident_and_status() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&target)
        .await;

    let fleet = Fleet::new(None).await;
    let liveness = Liveness::new();
    let (sample_tx, _) = broadcast::channel::<SampleEvent>(64);

    let evaluator = EvaluatorHandle::spawn(
        Arc::new(StoreThresholdSource::new(fleet.store.clone())),
        fleet.incidents.clone(),
        &sample_tx,
        Duration::from_secs(30),
    );
    evaluator.refresh_thresholds().await.unwrap();

    let probe = HealthProbe::new(reqwest::Client::new(), &service("scout", &target.uri())).unwrap();
    let collector = CollectorHandle::spawn(
        Arc::new(probe),
        fleet.store.clone(),
        sample_tx.clone(),
        liveness.clone(),
        settings(),
    );

    let report = collector.probe_now().await.unwrap();
    assert!(report.probe_failed);

    wait_until(|| async { fleet.incidents_open().await.len() == 1 }).await;
    let incident = fleet.incidents_open().await.remove(0);
    assert_eq!(incident.service_name, "scout");

    let aggregator = AggregatorHandle::spawn(
        Arc::new(grove_monitor::aggregate::Aggregator::new(
            fleet.store.clone(),
            fleet.cache.clone(),
            Arc::new(StoreThresholdSource::new(fleet.store.clone())),
            fleet.config.service_names(),
            Duration::from_secs(600),
            Duration::from_secs(5),
        )),
        liveness.clone(),
        Duration::from_secs(3600),
    );
    let snapshot = aggregator.run_now().await.unwrap();
    assert_eq!(snapshot.overview.down_services, 1);
    assert_eq!(snapshot.overview.active_incidents, 1);

    let scout: ServiceStatusEntry = get_entry(fleet.cache.as_ref(), &CacheKey::service_status("scout"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(scout.status, ServiceStatus::Down);

    let report = liveness.report(chrono::Utc::now(), Duration::from_secs(60));
    assert!(!report.collectors["scout:health"].stalled);
    assert!(!report.aggregator_stalled);

    collector.shutdown().await.unwrap();
    evaluator.shutdown().await.unwrap();
    aggregator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovered_service_resolves_incident() {
    let target = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&target)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&target)
        .await;

    let fleet = Fleet::new(None).await;
    let (sample_tx, _) = broadcast::channel::<SampleEvent>(64);
    let evaluator = EvaluatorHandle::spawn(
        Arc::new(StoreThresholdSource::new(fleet.store.clone())),
        fleet.incidents.clone(),
        &sample_tx,
        Duration::from_secs(30),
    );
    evaluator.refresh_thresholds().await.unwrap();

    // The collector's first tick and this call together use up both failures
    let probe = HealthProbe::new(reqwest::Client::new(), &service("groveauth", &target.uri())).unwrap();
    let collector = CollectorHandle::spawn(
        Arc::new(probe),
        fleet.store.clone(),
        sample_tx.clone(),
        Liveness::new(),
        settings(),
    );
    collector.probe_now().await.unwrap();
    wait_until(|| async { fleet.incidents_open().await.len() == 1 }).await;

    let report = collector.probe_now().await.unwrap();
    assert!(!report.probe_failed);
    wait_until(|| async { fleet.incidents_open().await.is_empty() }).await;

    collector.shutdown().await.unwrap();
    evaluator.shutdown().await.unwrap();
}
