//! Shared fixtures: a four-service fleet with the built-in thresholds

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use grove_monitor::{
    aggregate::Aggregator,
    cache::MemoryCache,
    config::{Config, parse_config},
    evaluation::{StoreThresholdSource, evaluate},
    incident::{IncidentManager, IncidentSettings, Transition},
    notify::WebhookNotifier,
    storage::{AlertThreshold, HealthCheck, MemoryBackend, Metric, NewSample, SampleStore},
};

pub const FLEET: [&str; 4] = ["groveauth", "scout", "grove-domain-tool", "autumnsgrove"];

pub fn fleet_config(webhook_url: Option<&str>) -> Config {
    let services: Vec<_> = FLEET
        .iter()
        .map(|name| {
            serde_json::json!({
                "name": name,
                "endpoint": format!("https://{name}.grove.place"),
            })
        })
        .collect();

    let mut value = serde_json::json!({
        "services": services,
        "storage": { "backend": "none" },
    });
    if let Some(url) = webhook_url {
        value["alerts"] = serde_json::json!({ "webhook_url": url });
    }

    parse_config(&value.to_string()).unwrap()
}

pub struct Fleet {
    pub config: Config,
    pub store: Arc<MemoryBackend>,
    pub cache: Arc<MemoryCache>,
    pub incidents: Arc<IncidentManager>,
    pub aggregator: Aggregator,
}

impl Fleet {
    pub async fn new(webhook_url: Option<&str>) -> Self {
        Self::with_store(webhook_url, Arc::new(MemoryBackend::new())).await
    }

    pub async fn with_store(webhook_url: Option<&str>, store: Arc<MemoryBackend>) -> Self {
        let config = fleet_config(webhook_url);
        if store.list_thresholds().await.unwrap().is_empty() {
            for row in config.threshold_rows() {
                store.insert_threshold(row).await.unwrap();
            }
        }

        let cache = Arc::new(MemoryCache::new());
        let notifier = Arc::new(WebhookNotifier::new(Duration::from_secs(2)).unwrap());
        let incidents = Arc::new(IncidentManager::new(
            store.clone(),
            cache.clone(),
            notifier,
            IncidentSettings {
                webhook_url: webhook_url.map(String::from),
                retry_backoff: Duration::from_millis(10),
                ..IncidentSettings::default()
            },
        ));
        let aggregator = Aggregator::new(
            store.clone(),
            cache.clone(),
            Arc::new(StoreThresholdSource::new(store.clone())),
            config.service_names(),
            Duration::from_secs(600),
            Duration::from_secs(5),
        );

        Self {
            config,
            store,
            cache,
            incidents,
            aggregator,
        }
    }

    pub async fn thresholds(&self) -> Vec<AlertThreshold> {
        self.store.list_thresholds().await.unwrap()
    }

    /// Store a sample and hand every observation to the incident manager,
    /// the way the evaluator does
    pub async fn ingest(&self, sample: NewSample) -> Vec<Transition> {
        self.store.append(sample.clone()).await.unwrap();
        let thresholds = self.thresholds().await;

        let mut transitions = Vec::new();
        for observation in sample.observations() {
            let evaluation = evaluate(
                &thresholds,
                &observation.service_name,
                &observation.metric_type,
                observation.value,
            );
            transitions.push(self.incidents.handle(evaluation).await.unwrap());
        }
        transitions
    }
}

pub fn health(service: &str, healthy: bool, at: DateTime<Utc>) -> NewSample {
    NewSample::HealthCheck(HealthCheck {
        service_name: service.to_string(),
        endpoint: format!("https://{service}.grove.place/health"),
        status_code: Some(if healthy { 200 } else { 503 }),
        response_time_ms: Some(120),
        is_healthy: healthy,
        error_message: (!healthy).then(|| "503 Service Unavailable".to_string()),
        checked_at: at,
    })
}

pub fn metric(service: &str, metric_type: &str, value: f64, at: DateTime<Utc>) -> NewSample {
    NewSample::Metric(Metric {
        service_name: service.to_string(),
        metric_type: metric_type.to_string(),
        value,
        unit: None,
        recorded_at: at,
        metadata: None,
    })
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}

impl Fleet {
    pub async fn incidents_open(&self) -> Vec<grove_monitor::storage::Incident> {
        self.store.list_open_incidents().await.unwrap()
    }
}
