//! Well-known metric types and the incident titles derived from them.

pub const HEALTH_CHECK: &str = "health_check";
pub const RESPONSE_TIME_MS: &str = "response_time_ms";
pub const PROBE_FAILURE: &str = "probe_failure";

pub const REQUESTS: &str = "requests";
pub const ERRORS: &str = "errors";
pub const ERROR_RATE: &str = "error_rate";
pub const REQUESTS_PER_MIN: &str = "requests_per_min";
pub const LATENCY_P50: &str = "latency_p50";
pub const LATENCY_P95: &str = "latency_p95";
pub const LATENCY_P99: &str = "latency_p99";
pub const CPU_TIME: &str = "cpu_time";

pub const D1_SIZE_BYTES: &str = "d1_size_bytes";
pub const D1_ROWS_READ: &str = "d1_rows_read";
pub const D1_ROWS_WRITTEN: &str = "d1_rows_written";
pub const R2_OBJECT_COUNT: &str = "r2_object_count";
pub const R2_SIZE_BYTES: &str = "r2_size_bytes";
pub const R2_READS: &str = "r2_reads";
pub const R2_WRITES: &str = "r2_writes";
pub const KV_READS: &str = "kv_reads";
pub const KV_WRITES: &str = "kv_writes";

pub const DAILY_COST_USD: &str = "daily_cost_usd";

/// Sample kind that carries a given metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    HealthCheck,
    Metric,
    StorageStat,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::HealthCheck => "health_check",
            SourceKind::Metric => "metric",
            SourceKind::StorageStat => "storage_stat",
        }
    }
}

/// Which sample kind a metric type is read from.
pub fn source_kind(metric_type: &str) -> SourceKind {
    match metric_type {
        HEALTH_CHECK | RESPONSE_TIME_MS => SourceKind::HealthCheck,
        D1_SIZE_BYTES | D1_ROWS_READ | D1_ROWS_WRITTEN | R2_OBJECT_COUNT | R2_SIZE_BYTES
        | R2_READS | R2_WRITES | KV_READS | KV_WRITES => SourceKind::StorageStat,
        _ => SourceKind::Metric,
    }
}

/// Incident title for a metric type.
///
/// Severity is deliberately absent so an escalating breach keeps its key.
pub fn incident_title(metric_type: &str) -> String {
    match metric_type {
        HEALTH_CHECK => "Health check failing".to_string(),
        ERROR_RATE => "High error rate".to_string(),
        LATENCY_P95 => "High p95 latency".to_string(),
        LATENCY_P99 => "High p99 latency".to_string(),
        D1_SIZE_BYTES => "Database approaching size limit".to_string(),
        DAILY_COST_USD => "Daily cost above budget".to_string(),
        other => format!("Threshold breached: {other}"),
    }
}
