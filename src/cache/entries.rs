//! Values stored under the cache key families.
//!
//! All of these are derived from the sample store and the incident table and
//! can be thrown away at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Incident;
use crate::{ServiceStatus, Severity};

/// `status:{service}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusEntry {
    pub service: String,
    pub status: ServiceStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub requests_per_min: Option<f64>,
}

/// `metrics:latest:{service}`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestMetrics {
    pub requests: Option<f64>,
    pub errors: Option<f64>,
    pub p50_latency: Option<f64>,
    pub p95_latency: Option<f64>,
    pub p99_latency: Option<f64>,
    pub cpu_time: Option<f64>,

    /// Newest sample the values were read from
    pub timestamp: Option<DateTime<Utc>>,
}

impl LatestMetrics {
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveIncident {
    pub id: i64,
    pub service: String,
    pub severity: Severity,
    pub title: String,
    pub triggered_at: DateTime<Utc>,
}

impl From<&Incident> for ActiveIncident {
    fn from(incident: &Incident) -> Self {
        Self {
            id: incident.id,
            service: incident.service_name.clone(),
            severity: incident.severity,
            title: incident.title.clone(),
            triggered_at: incident.triggered_at,
        }
    }
}

/// `incidents:active`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActiveIncidents {
    pub incidents: Vec<ActiveIncident>,
}

impl ActiveIncidents {
    pub fn from_open(open: &[Incident]) -> Self {
        Self {
            incidents: open.iter().map(ActiveIncident::from).collect(),
        }
    }
}

/// `overview:current`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOverview {
    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub down_services: usize,
    pub unknown_services: usize,
    pub total_requests_today: u64,
    pub total_errors_today: u64,
    pub active_incidents: usize,
    pub last_updated: DateTime<Utc>,
}
