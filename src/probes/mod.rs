//! Probes: one observation of one target
//!
//! A probe turns a monitored target into samples. Failing to reach a target is
//! not an error for the rest of the system; [`Probe::failure_samples`] turns
//! the failure into samples of its own so every completed probe is recorded.

pub mod http;
pub mod stats;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::storage::NewSample;

pub use http::{HealthProbe, ServiceMetricsProbe};
pub use stats::StorageStatsProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    ServiceHealth,
    ServiceMetrics,
    Database,
    Bucket,
    KvNamespace,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::ServiceHealth => "health",
            TargetKind::ServiceMetrics => "metrics",
            TargetKind::Database => "database",
            TargetKind::Bucket => "bucket",
            TargetKind::KvNamespace => "kv_namespace",
        };
        f.write_str(s)
    }
}

/// What a probe looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Service or storage target name samples are recorded under
    pub name: String,
    pub kind: TargetKind,
    pub url: String,
}

impl ProbeTarget {
    /// Collector identity, unique per (name, kind)
    pub fn collector_id(&self) -> String {
        format!("{}:{}", self.name, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeFailure {
    Timeout,
    Network(String),

    /// Target answered with a status outside the accepted set
    HttpStatus { status: u16, response_time_ms: u64 },

    /// Body could not be read or decoded
    InvalidResponse(String),
}

impl ProbeFailure {
    /// Worth one more attempt?
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeFailure::Timeout | ProbeFailure::Network(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProbeFailure::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "probe timed out"),
            ProbeFailure::Network(msg) => write!(f, "network error: {}", msg),
            ProbeFailure::HttpStatus { status, .. } => write!(f, "unexpected status {}", status),
            ProbeFailure::InvalidResponse(msg) => write!(f, "invalid response: {}", msg),
        }
    }
}

impl std::error::Error for ProbeFailure {}

impl From<reqwest::Error> for ProbeFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeFailure::Timeout
        } else if err.is_decode() || err.is_body() {
            ProbeFailure::InvalidResponse(err.to_string())
        } else {
            ProbeFailure::Network(err.to_string())
        }
    }
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn target(&self) -> &ProbeTarget;

    /// Observe the target once
    async fn probe(&self) -> Result<Vec<NewSample>, ProbeFailure>;

    /// Samples recording a failed probe
    fn failure_samples(&self, failure: &ProbeFailure, at: DateTime<Utc>) -> Vec<NewSample>;
}

/// Failure marker for probes without health semantics
pub(crate) fn probe_failure_metric(
    target: &ProbeTarget,
    failure: &ProbeFailure,
    at: DateTime<Utc>,
) -> NewSample {
    NewSample::Metric(crate::storage::Metric {
        service_name: target.name.clone(),
        metric_type: crate::metrics::PROBE_FAILURE.to_string(),
        value: 1.0,
        unit: None,
        recorded_at: at,
        metadata: Some(serde_json::json!({
            "probe": target.kind.to_string(),
            "url": target.url,
            "error": failure.to_string(),
        })),
    })
}
