//! Service probes: health endpoints and analytics endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{instrument, trace};

use super::{Probe, ProbeFailure, ProbeTarget, TargetKind, probe_failure_metric};
use crate::config::ServiceConfig;
use crate::metrics;
use crate::storage::{HealthCheck, Metric, NewSample};

/// GETs a service's health endpoint
pub struct HealthProbe {
    target: ProbeTarget,
    client: Client,
    expected_status: Vec<u16>,
    body_pattern: Option<Regex>,
}

impl HealthProbe {
    pub fn new(client: Client, service: &ServiceConfig) -> Result<Self, regex::Error> {
        let body_pattern = service
            .body_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        Ok(Self {
            target: ProbeTarget {
                name: service.name.clone(),
                kind: TargetKind::ServiceHealth,
                url: service.health_url(),
            },
            client,
            expected_status: service.expected_status.clone(),
            body_pattern,
        })
    }

    fn accepts(&self, status: u16) -> bool {
        if self.expected_status.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expected_status.contains(&status)
        }
    }

    fn sample(
        &self,
        status_code: Option<u16>,
        response_time_ms: Option<u64>,
        error_message: Option<String>,
        at: DateTime<Utc>,
    ) -> NewSample {
        NewSample::HealthCheck(HealthCheck {
            service_name: self.target.name.clone(),
            endpoint: self.target.url.clone(),
            status_code,
            response_time_ms,
            is_healthy: error_message.is_none(),
            error_message,
            checked_at: at,
        })
    }
}

#[async_trait]
impl Probe for HealthProbe {
    fn target(&self) -> &ProbeTarget {
        &self.target
    }

    #[instrument(skip(self), fields(service = %self.target.name))]
    async fn probe(&self) -> Result<Vec<NewSample>, ProbeFailure> {
        let started = Instant::now();
        let response = self.client.get(&self.target.url).send().await?;
        let status = response.status().as_u16();
        let response_time_ms = started.elapsed().as_millis() as u64;

        if !self.accepts(status) {
            return Err(ProbeFailure::HttpStatus {
                status,
                response_time_ms,
            });
        }

        let error_message = match &self.body_pattern {
            Some(pattern) => {
                let body = response.text().await?;
                (!pattern.is_match(&body))
                    .then(|| format!("response body does not match /{}/", pattern.as_str()))
            }
            None => None,
        };

        trace!("health probe answered {status} in {response_time_ms}ms");
        Ok(vec![self.sample(
            Some(status),
            Some(response_time_ms),
            error_message,
            Utc::now(),
        )])
    }

    fn failure_samples(&self, failure: &ProbeFailure, at: DateTime<Utc>) -> Vec<NewSample> {
        let response_time_ms = match failure {
            ProbeFailure::HttpStatus {
                response_time_ms, ..
            } => Some(*response_time_ms),
            _ => None,
        };
        vec![self.sample(
            failure.status_code(),
            response_time_ms,
            Some(failure.to_string()),
            at,
        )]
    }
}

/// Analytics endpoint response
///
/// Counts cover the period since the previous probe.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAnalytics {
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub errors: u64,
    pub p50_latency: Option<f64>,
    pub p95_latency: Option<f64>,
    pub p99_latency: Option<f64>,
    pub cpu_time: Option<f64>,
}

impl ServiceAnalytics {
    /// Errors as a percentage of requests, 0 without traffic
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64 * 100.0
        }
    }
}

/// Reads request, error and latency figures for a service
pub struct ServiceMetricsProbe {
    target: ProbeTarget,
    client: Client,
    interval: Duration,
}

impl ServiceMetricsProbe {
    pub fn new(client: Client, name: &str, metrics_url: &str, interval: Duration) -> Self {
        Self {
            target: ProbeTarget {
                name: name.to_string(),
                kind: TargetKind::ServiceMetrics,
                url: metrics_url.to_string(),
            },
            client,
            interval,
        }
    }

    pub fn samples(&self, analytics: &ServiceAnalytics, at: DateTime<Utc>) -> Vec<NewSample> {
        let minutes = (self.interval.as_secs_f64() / 60.0).max(1.0 / 60.0);

        let mut values: Vec<(&str, f64, &str)> = vec![
            (metrics::REQUESTS, analytics.requests as f64, "count"),
            (metrics::ERRORS, analytics.errors as f64, "count"),
            (metrics::ERROR_RATE, analytics.error_rate(), "percent"),
            (
                metrics::REQUESTS_PER_MIN,
                analytics.requests as f64 / minutes,
                "requests/min",
            ),
        ];
        let optional = [
            (metrics::LATENCY_P50, analytics.p50_latency, "ms"),
            (metrics::LATENCY_P95, analytics.p95_latency, "ms"),
            (metrics::LATENCY_P99, analytics.p99_latency, "ms"),
            (metrics::CPU_TIME, analytics.cpu_time, "ms"),
        ];
        values.extend(
            optional
                .into_iter()
                .filter_map(|(name, value, unit)| value.map(|v| (name, v, unit))),
        );

        values
            .into_iter()
            .map(|(metric_type, value, unit)| {
                NewSample::Metric(Metric {
                    service_name: self.target.name.clone(),
                    metric_type: metric_type.to_string(),
                    value,
                    unit: Some(unit.to_string()),
                    recorded_at: at,
                    metadata: None,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Probe for ServiceMetricsProbe {
    fn target(&self) -> &ProbeTarget {
        &self.target
    }

    #[instrument(skip(self), fields(service = %self.target.name))]
    async fn probe(&self) -> Result<Vec<NewSample>, ProbeFailure> {
        let started = Instant::now();
        let response = self.client.get(&self.target.url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(ProbeFailure::HttpStatus {
                status: status.as_u16(),
                response_time_ms: started.elapsed().as_millis() as u64,
            });
        }

        let body = response.text().await?;
        let analytics: ServiceAnalytics = serde_json::from_str(&body)
            .map_err(|e| ProbeFailure::InvalidResponse(format!("failed to parse analytics: {e}")))?;

        Ok(self.samples(&analytics, Utc::now()))
    }

    fn failure_samples(&self, failure: &ProbeFailure, at: DateTime<Utc>) -> Vec<NewSample> {
        vec![probe_failure_metric(&self.target, failure, at)]
    }
}
