//! Durable record types
//!
//! ## Samples
//!
//! A sample is one immutable observation written by a collector. Three kinds
//! exist, mirroring the three probe families:
//!
//! - **HealthCheck** - result of hitting a service's health endpoint
//! - **Metric** - a named numeric value for a service (`error_rate`, `latency_p95`, ...)
//! - **StorageStat** - size/usage counters for a database, bucket or KV namespace
//!
//! Each sample expands into [`Observation`]s, the `(subject, metric_type, value)`
//! triples thresholds are evaluated against.
//!
//! ## Incidents, thresholds, daily aggregates
//!
//! Incidents and daily aggregates are owned by the monitoring core. Thresholds
//! are configuration and only read by the evaluator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::{self, SourceKind};
use crate::{Operator, Severity};

/// Opaque, monotonic sample identifier assigned by the store.
pub type SampleId = i64;

/// Incident identifier assigned by the store.
pub type IncidentId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Service the endpoint belongs to
    pub service_name: String,

    /// Full URL that was probed
    pub endpoint: String,

    pub status_code: Option<u16>,

    pub response_time_ms: Option<u64>,

    pub is_healthy: bool,

    pub error_message: Option<String>,

    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub service_name: String,
    pub metric_type: String,
    pub value: f64,
    pub unit: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Class of storage target a [`StorageStat`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTargetKind {
    Database,
    Bucket,
    KvNamespace,
}

impl fmt::Display for StorageTargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTargetKind::Database => write!(f, "database"),
            StorageTargetKind::Bucket => write!(f, "bucket"),
            StorageTargetKind::KvNamespace => write!(f, "kv_namespace"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStat {
    pub target_name: String,
    pub target_kind: StorageTargetKind,

    /// Database size, or total bucket size
    pub size_bytes: Option<u64>,

    /// Bucket objects or namespace keys
    pub object_count: Option<u64>,

    /// Reads since the previous probe (rows for databases, operations otherwise)
    pub reads: Option<u64>,

    /// Writes since the previous probe
    pub writes: Option<u64>,

    pub recorded_at: DateTime<Utc>,
}

/// A sample before the store assigned its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewSample {
    HealthCheck(HealthCheck),
    Metric(Metric),
    StorageStat(StorageStat),
}

/// One numeric observation extracted from a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub service_name: String,
    pub metric_type: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

impl NewSample {
    /// Service, database, bucket or namespace name the sample is about.
    pub fn subject(&self) -> &str {
        match self {
            NewSample::HealthCheck(check) => &check.service_name,
            NewSample::Metric(metric) => &metric.service_name,
            NewSample::StorageStat(stat) => &stat.target_name,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            NewSample::HealthCheck(check) => check.checked_at,
            NewSample::Metric(metric) => metric.recorded_at,
            NewSample::StorageStat(stat) => stat.recorded_at,
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        match self {
            NewSample::HealthCheck(_) => SourceKind::HealthCheck,
            NewSample::Metric(_) => SourceKind::Metric,
            NewSample::StorageStat(_) => SourceKind::StorageStat,
        }
    }

    /// Metric type column for metric samples.
    pub fn metric_type(&self) -> Option<&str> {
        match self {
            NewSample::Metric(metric) => Some(&metric.metric_type),
            _ => None,
        }
    }

    /// Is this the kind of sample `metric_type` is read from?
    ///
    /// Storage backends use this to answer `query_latest`.
    pub fn provides(&self, metric_type: &str) -> bool {
        let kind = metrics::source_kind(metric_type);
        if kind != self.source_kind() {
            return false;
        }
        match self {
            NewSample::Metric(metric) => metric.metric_type == metric_type,
            _ => true,
        }
    }

    /// Value of a single metric type carried by this sample, if any.
    pub fn value_of(&self, metric_type: &str) -> Option<f64> {
        self.observations()
            .into_iter()
            .find(|o| o.metric_type == metric_type)
            .map(|o| o.value)
    }

    pub fn observations(&self) -> Vec<Observation> {
        let subject = self.subject().to_string();
        let at = self.timestamp();
        let observe = |metric_type: &str, value: f64| Observation {
            service_name: subject.clone(),
            metric_type: metric_type.to_string(),
            value,
            observed_at: at,
        };

        let mut out = Vec::new();
        match self {
            NewSample::HealthCheck(check) => {
                out.push(observe(
                    metrics::HEALTH_CHECK,
                    if check.is_healthy { 1.0 } else { 0.0 },
                ));
                if let Some(ms) = check.response_time_ms {
                    out.push(observe(metrics::RESPONSE_TIME_MS, ms as f64));
                }
            }
            NewSample::Metric(metric) => {
                if metric.value.is_finite() {
                    out.push(observe(&metric.metric_type, metric.value));
                }
            }
            NewSample::StorageStat(stat) => {
                let fields: [(&str, Option<u64>); 4] = match stat.target_kind {
                    StorageTargetKind::Database => [
                        (metrics::D1_SIZE_BYTES, stat.size_bytes),
                        (metrics::D1_ROWS_READ, stat.reads),
                        (metrics::D1_ROWS_WRITTEN, stat.writes),
                        ("", None),
                    ],
                    StorageTargetKind::Bucket => [
                        (metrics::R2_SIZE_BYTES, stat.size_bytes),
                        (metrics::R2_OBJECT_COUNT, stat.object_count),
                        (metrics::R2_READS, stat.reads),
                        (metrics::R2_WRITES, stat.writes),
                    ],
                    StorageTargetKind::KvNamespace => [
                        (metrics::KV_READS, stat.reads),
                        (metrics::KV_WRITES, stat.writes),
                        ("", None),
                        ("", None),
                    ],
                };
                for (name, value) in fields {
                    if let Some(value) = value {
                        out.push(observe(name, value as f64));
                    }
                }
            }
        }
        out
    }
}

/// A stored sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: SampleId,

    #[serde(flatten)]
    pub data: NewSample,
}

impl std::ops::Deref for Sample {
    type Target = NewSample;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// Configured alert threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub id: i64,
    pub service_name: String,
    pub metric_type: String,
    pub operator: Operator,
    pub threshold_value: f64,
    pub severity: Severity,
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Threshold row before insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewThreshold {
    pub service_name: String,
    pub metric_type: String,
    pub operator: Operator,
    pub threshold_value: f64,
    pub severity: Severity,
    pub enabled: bool,
    pub webhook_url: Option<String>,
}

impl NewThreshold {
    pub fn into_threshold(self, id: i64, now: DateTime<Utc>) -> AlertThreshold {
        AlertThreshold {
            id,
            service_name: self.service_name,
            metric_type: self.metric_type,
            operator: self.operator,
            threshold_value: self.threshold_value,
            severity: self.severity,
            enabled: self.enabled,
            webhook_url: self.webhook_url,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle state derived from an incident's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub service_name: String,

    /// Metric the incident was raised for (its title is derived from it)
    pub metric_type: String,

    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,

    /// Most recent value seen while open
    pub last_value: Option<f64>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn state(&self) -> IncidentState {
        match (&self.resolved_at, &self.acknowledged_by) {
            (Some(_), _) => IncidentState::Resolved,
            (None, Some(_)) => IncidentState::Acknowledged,
            (None, None) => IncidentState::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub service_name: String,
    pub metric_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub last_value: Option<f64>,
}

impl NewIncident {
    pub fn into_incident(self, id: IncidentId) -> Incident {
        Incident {
            id,
            service_name: self.service_name,
            metric_type: self.metric_type,
            severity: self.severity,
            title: self.title,
            description: self.description,
            triggered_at: self.triggered_at,
            resolved_at: None,
            acknowledged_by: None,
            last_value: self.last_value,
        }
    }
}

/// Per (date, service) rollup, written once after the day is over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub service_name: String,
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_d1_reads: u64,
    pub total_d1_writes: u64,
    pub total_r2_reads: u64,
    pub total_r2_writes: u64,
    pub total_kv_reads: u64,
    pub total_kv_writes: u64,
    pub estimated_cost_usd: f64,
}

impl FromStr for StorageTargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(StorageTargetKind::Database),
            "bucket" => Ok(StorageTargetKind::Bucket),
            "kv_namespace" => Ok(StorageTargetKind::KvNamespace),
            other => Err(format!("unknown storage target kind '{other}'")),
        }
    }
}
