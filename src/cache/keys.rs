//! Fixed cache key families and their expiry.

use std::fmt;
use std::time::Duration;

/// Per-service status and latest metrics expire after ten minutes.
pub const SERVICE_STATUS_TTL: Duration = Duration::from_secs(600);
pub const LATEST_METRICS_TTL: Duration = Duration::from_secs(600);

/// The overview is rewritten more often than it expires.
pub const SYSTEM_OVERVIEW_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// `status:{service}`
    ServiceStatus(String),

    /// `metrics:latest:{service}`
    LatestMetrics(String),

    /// `incidents:active`, never expires and is rewritten on every transition
    ActiveIncidents,

    /// `overview:current`
    SystemOverview,
}

impl CacheKey {
    pub fn service_status(service: impl Into<String>) -> Self {
        CacheKey::ServiceStatus(service.into())
    }

    pub fn latest_metrics(service: impl Into<String>) -> Self {
        CacheKey::LatestMetrics(service.into())
    }

    /// Rendered key string
    pub fn as_key(&self) -> String {
        match self {
            CacheKey::ServiceStatus(service) => format!("status:{service}"),
            CacheKey::LatestMetrics(service) => format!("metrics:latest:{service}"),
            CacheKey::ActiveIncidents => "incidents:active".to_string(),
            CacheKey::SystemOverview => "overview:current".to_string(),
        }
    }

    /// Expiry for this key family, `None` for keys that never expire
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            CacheKey::ServiceStatus(_) => Some(SERVICE_STATUS_TTL),
            CacheKey::LatestMetrics(_) => Some(LATEST_METRICS_TTL),
            CacheKey::ActiveIncidents => None,
            CacheKey::SystemOverview => Some(SYSTEM_OVERVIEW_TTL),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}
