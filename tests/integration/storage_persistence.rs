//! Incident and sample state survives a restart on SQLite

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use grove_monitor::{
    ServiceStatus, Severity,
    aggregate::Aggregator,
    cache::{ActiveIncidents, CacheKey, MemoryCache, get_entry},
    evaluation::{Evaluation, StoreThresholdSource, evaluate},
    incident::{IncidentManager, IncidentSettings, Transition},
    metrics,
    notify::WebhookNotifier,
    storage::{SampleStore, sqlite::SqliteBackend},
};
use tempfile::TempDir;

use crate::helpers::*;

struct Process {
    store: Arc<SqliteBackend>,
    cache: Arc<MemoryCache>,
    incidents: IncidentManager,
    aggregator: Aggregator,
}

async fn start(dir: &TempDir) -> Process {
    let store = Arc::new(SqliteBackend::new(dir.path().join("monitor.db")).await.unwrap());
    if store.list_thresholds().await.unwrap().is_empty() {
        for row in fleet_config(None).threshold_rows() {
            store.insert_threshold(row).await.unwrap();
        }
    }

    let cache = Arc::new(MemoryCache::new());
    let incidents = IncidentManager::new(
        store.clone(),
        cache.clone(),
        Arc::new(WebhookNotifier::new(Duration::from_secs(1)).unwrap()),
        IncidentSettings {
            alerts_enabled: false,
            ..IncidentSettings::default()
        },
    );
    let aggregator = Aggregator::new(
        store.clone(),
        cache.clone(),
        Arc::new(StoreThresholdSource::new(store.clone())),
        FLEET.iter().map(|s| s.to_string()).collect(),
        Duration::from_secs(600),
        Duration::from_secs(5),
    );

    Process {
        store,
        cache,
        incidents,
        aggregator,
    }
}

async fn breach(process: &Process, service: &str, value: f64) -> Transition {
    let thresholds = process.store.list_thresholds().await.unwrap();
    process
        .store
        .append(metric(service, metrics::ERROR_RATE, value, Utc::now()))
        .await
        .unwrap();
    let evaluation = evaluate(&thresholds, service, metrics::ERROR_RATE, value);
    assert!(matches!(evaluation, Evaluation::Matched(_) | Evaluation::Cleared { .. }));
    process.incidents.handle(evaluation).await.unwrap()
}

#[tokio::test]
async fn test_open_incident_survives_restart() {
    let dir = TempDir::new().unwrap();

    let first = start(&dir).await;
    first
        .store
        .append(health("groveauth", true, Utc::now()))
        .await
        .unwrap();
    let Transition::Opened(opened) = breach(&first, "groveauth", 12.0).await else {
        panic!("expected a new incident");
    };
    first.store.close().await.unwrap();
    drop(first);

    let second = start(&dir).await;
    let snapshot = second.aggregator.rebuild(Utc::now()).await.unwrap();

    let active: ActiveIncidents = get_entry(second.cache.as_ref(), &CacheKey::ActiveIncidents)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.incidents.len(), 1);
    assert_eq!(active.incidents[0].id, opened.id);
    assert_eq!(active.incidents[0].severity, Severity::Critical);

    let groveauth = snapshot
        .services
        .iter()
        .find(|s| s.status.service == "groveauth")
        .unwrap();
    assert_eq!(groveauth.status.status, ServiceStatus::Degraded);

    // The restarted process coalesces into the incident it did not open
    let transition = breach(&second, "groveauth", 13.0).await;
    assert!(matches!(transition, Transition::Coalesced { ref incident, .. } if incident.id == opened.id));

    let transition = breach(&second, "groveauth", 0.5).await;
    let Transition::Resolved(resolved) = transition else {
        panic!("expected resolution, got {transition:?}");
    };
    assert!(resolved.resolved_at.unwrap() >= resolved.triggered_at);
    assert_eq!(resolved.triggered_at, opened.triggered_at);
}

#[tokio::test]
async fn test_two_processes_share_one_open_incident() {
    let dir = TempDir::new().unwrap();
    let a = start(&dir).await;
    let b = start(&dir).await;

    let (first, second) = tokio::join!(breach(&a, "scout", 20.0), breach(&b, "scout", 21.0));

    let opened = [&first, &second]
        .iter()
        .filter(|t| matches!(t, Transition::Opened(_)))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(a.store.list_open_incidents().await.unwrap().len(), 1);
}
