//! Fleet status derivation
//!
//! [`Aggregator::compute`] derives every cached value from the sample store,
//! the threshold table and the open incidents. It holds no state between
//! cycles, so computing twice over the same store contents and `now` gives the
//! same snapshot, and [`Aggregator::rebuild`] after a restart yields what the
//! live loop would have written.
//!
//! Status mapping for a service:
//!
//! - no health check inside the freshness horizon → `unknown`
//! - a matching `health_check` threshold → `down`
//!   (without health thresholds, an unhealthy check is `down`)
//! - a matching `error_rate` or `latency_p95` threshold at warning or above → `degraded`
//! - otherwise → `healthy`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tracing::{debug, instrument, warn};

use crate::cache::{
    ActiveIncidents, CacheKey, LatestMetrics, ServiceStatusEntry, StatusCache, SystemOverview,
    put_entry,
};
use crate::evaluation::{Evaluation, ThresholdSource, evaluate};
use crate::metrics;
use crate::storage::{
    AlertThreshold, HealthCheck, Incident, NewSample, Sample, SampleStore, StorageResult,
    with_timeout,
};
use crate::{ServiceStatus, Severity};

/// Everything one aggregation cycle writes
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSnapshot {
    pub services: Vec<ServiceSnapshot>,
    pub active_incidents: ActiveIncidents,
    pub overview: SystemOverview,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub status: ServiceStatusEntry,
    pub metrics: LatestMetrics,
    pub requests_today: u64,
    pub errors_today: u64,
}

/// Count of cache writes that failed in one publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    pub written: usize,
    pub failed: usize,
}

pub struct Aggregator {
    store: Arc<dyn SampleStore>,
    cache: Arc<dyn StatusCache>,
    thresholds: Arc<dyn ThresholdSource>,
    services: Vec<String>,
    freshness_horizon: Duration,
    store_timeout: Duration,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn SampleStore>,
        cache: Arc<dyn StatusCache>,
        thresholds: Arc<dyn ThresholdSource>,
        services: Vec<String>,
        freshness_horizon: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            thresholds,
            services,
            freshness_horizon,
            store_timeout,
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Derive the fleet snapshot as of `now`
    #[instrument(skip(self))]
    pub async fn compute(&self, now: DateTime<Utc>) -> StorageResult<FleetSnapshot> {
        let thresholds = with_timeout(self.store_timeout, self.thresholds.snapshot()).await?;
        let open = with_timeout(self.store_timeout, self.store.list_open_incidents()).await?;

        let horizon = chrono::Duration::from_std(self.freshness_horizon)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let horizon_start = now - horizon;
        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();

        let mut services = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let from = horizon_start.min(day_start);
            // Inclusive of samples stamped exactly at `now`
            let to = now + chrono::Duration::milliseconds(1);
            let samples = with_timeout(
                self.store_timeout,
                self.store.query_range(service, from, to),
            )
            .await?;

            services.push(derive_service(
                service,
                &samples,
                &thresholds,
                horizon_start,
                day_start,
            ));
        }

        let overview = fold_overview(&services, &open, now);
        debug!(
            "derived {} services, {} open incidents",
            services.len(),
            open.len()
        );

        Ok(FleetSnapshot {
            services,
            active_incidents: ActiveIncidents::from_open(&open),
            overview,
        })
    }

    /// Write every key of `snapshot` wholesale
    ///
    /// A failed write is logged and left for the next cycle.
    pub async fn publish(&self, snapshot: &FleetSnapshot) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();
        let cache = self.cache.as_ref();

        for service in &snapshot.services {
            let name = &service.status.service;
            record(
                &mut outcome,
                &CacheKey::service_status(name),
                put_entry(cache, &CacheKey::service_status(name), &service.status).await,
            );

            let key = CacheKey::latest_metrics(name);
            let result = if service.metrics.is_empty() {
                cache.delete(&key).await
            } else {
                put_entry(cache, &key, &service.metrics).await
            };
            record(&mut outcome, &key, result);
        }

        record(
            &mut outcome,
            &CacheKey::ActiveIncidents,
            put_entry(cache, &CacheKey::ActiveIncidents, &snapshot.active_incidents).await,
        );
        record(
            &mut outcome,
            &CacheKey::SystemOverview,
            put_entry(cache, &CacheKey::SystemOverview, &snapshot.overview).await,
        );

        outcome
    }

    /// Recompute and republish everything, e.g. after a restart
    pub async fn rebuild(&self, now: DateTime<Utc>) -> StorageResult<FleetSnapshot> {
        let snapshot = self.compute(now).await?;
        let outcome = self.publish(&snapshot).await;
        if outcome.failed > 0 {
            warn!("{} cache writes failed during rebuild", outcome.failed);
        }
        Ok(snapshot)
    }
}

fn record(outcome: &mut PublishOutcome, key: &CacheKey, result: crate::cache::CacheResult<()>) {
    match result {
        Ok(()) => outcome.written += 1,
        Err(e) => {
            outcome.failed += 1;
            warn!("cache write for {} failed: {}", key, e);
        }
    }
}

/// Newest value of `metric_type` at or after `since`
fn latest_value(
    samples: &[Sample],
    metric_type: &str,
    since: DateTime<Utc>,
) -> Option<(f64, DateTime<Utc>)> {
    samples
        .iter()
        .rev()
        .take_while(|sample| sample.timestamp() >= since)
        .find_map(|sample| {
            sample
                .value_of(metric_type)
                .map(|value| (value, sample.timestamp()))
        })
}

fn latest_health(samples: &[Sample], since: DateTime<Utc>) -> Option<&HealthCheck> {
    samples
        .iter()
        .rev()
        .take_while(|sample| sample.timestamp() >= since)
        .find_map(|sample| match &sample.data {
            NewSample::HealthCheck(check) => Some(check),
            _ => None,
        })
}

fn sum_since(samples: &[Sample], metric_type: &str, since: DateTime<Utc>) -> u64 {
    samples
        .iter()
        .filter(|sample| sample.timestamp() >= since)
        .filter_map(|sample| sample.value_of(metric_type))
        .map(|value| value.max(0.0).round() as u64)
        .sum()
}

fn breaches(
    thresholds: &[AlertThreshold],
    service: &str,
    metric_type: &str,
    value: Option<f64>,
    at_least: Severity,
) -> bool {
    let Some(value) = value else {
        return false;
    };
    matches!(
        evaluate(thresholds, service, metric_type, value),
        Evaluation::Matched(candidate) if candidate.severity >= at_least
    )
}

/// Status and latest metrics for one service from its recent samples
///
/// `samples` must be ordered oldest first.
pub fn derive_service(
    service: &str,
    samples: &[Sample],
    thresholds: &[AlertThreshold],
    horizon_start: DateTime<Utc>,
    day_start: DateTime<Utc>,
) -> ServiceSnapshot {
    let latest = |metric_type: &str| latest_value(samples, metric_type, horizon_start);

    let error_rate = latest(metrics::ERROR_RATE).map(|(v, _)| v);
    let latency_p95 = latest(metrics::LATENCY_P95).map(|(v, _)| v);
    let requests_per_min = latest(metrics::REQUESTS_PER_MIN).map(|(v, _)| v);
    let health = latest_health(samples, horizon_start);

    let status = match health {
        None => ServiceStatus::Unknown,
        Some(check) => {
            let health_value = if check.is_healthy { 1.0 } else { 0.0 };
            let down = match evaluate(thresholds, service, metrics::HEALTH_CHECK, health_value) {
                Evaluation::Matched(_) => true,
                Evaluation::Cleared { .. } => false,
                Evaluation::NotConfigured => !check.is_healthy,
            };

            let degraded = breaches(
                thresholds,
                service,
                metrics::ERROR_RATE,
                error_rate,
                Severity::Warning,
            ) || breaches(
                thresholds,
                service,
                metrics::LATENCY_P95,
                latency_p95,
                Severity::Warning,
            );

            if down {
                ServiceStatus::Down
            } else if degraded {
                ServiceStatus::Degraded
            } else {
                ServiceStatus::Healthy
            }
        }
    };

    let latency_ms = latency_p95.or_else(|| {
        health
            .and_then(|check| check.response_time_ms)
            .map(|ms| ms as f64)
    });

    let metric_readings = [
        latest(metrics::REQUESTS),
        latest(metrics::ERRORS),
        latest(metrics::LATENCY_P50),
        latest(metrics::LATENCY_P95),
        latest(metrics::LATENCY_P99),
        latest(metrics::CPU_TIME),
    ];
    let timestamp = metric_readings.iter().flatten().map(|(_, at)| *at).max();
    let [requests, errors, p50, p95, p99, cpu] = metric_readings.map(|r| r.map(|(v, _)| v));

    ServiceSnapshot {
        status: ServiceStatusEntry {
            service: service.to_string(),
            status,
            last_check: health.map(|check| check.checked_at),
            latency_ms,
            error_rate,
            requests_per_min,
        },
        metrics: LatestMetrics {
            requests,
            errors,
            p50_latency: p50,
            p95_latency: p95,
            p99_latency: p99,
            cpu_time: cpu,
            timestamp,
        },
        requests_today: sum_since(samples, metrics::REQUESTS, day_start),
        errors_today: sum_since(samples, metrics::ERRORS, day_start),
    }
}

/// Overview as a fold over per-service results
pub fn fold_overview(
    services: &[ServiceSnapshot],
    open: &[Incident],
    now: DateTime<Utc>,
) -> SystemOverview {
    let count = |status: ServiceStatus| {
        services
            .iter()
            .filter(|s| s.status.status == status)
            .count()
    };

    SystemOverview {
        total_services: services.len(),
        healthy_services: count(ServiceStatus::Healthy),
        degraded_services: count(ServiceStatus::Degraded),
        down_services: count(ServiceStatus::Down),
        unknown_services: count(ServiceStatus::Unknown),
        total_requests_today: services.iter().map(|s| s.requests_today).sum(),
        total_errors_today: services.iter().map(|s| s.errors_today).sum(),
        active_incidents: open.len(),
        last_updated: now,
    }
}
