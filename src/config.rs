use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use regex::Regex;
use tracing::trace;

use crate::metrics;
use crate::storage::NewThreshold;
use crate::{Operator, Severity};

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (samples older than this are deleted)
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl StorageConfig {
    pub fn retention_days(&self) -> u32 {
        match self {
            StorageConfig::None => default_retention_days(),
            StorageConfig::Sqlite { retention_days, .. } => *retention_days,
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./monitor.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    #[serde(default)]
    pub buckets: Vec<BucketConfig>,

    #[serde(default)]
    pub kv_namespaces: Vec<KvNamespaceConfig>,

    /// Extra thresholds seeded into an empty threshold table
    #[serde(default)]
    pub thresholds: Vec<ThresholdSeed>,

    /// Seed the built-in thresholds as well
    #[serde(default = "default_true")]
    pub seed_default_thresholds: bool,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub collection: CollectionConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Base URL, e.g. `https://auth.grove.place`
    pub endpoint: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Seconds between probes, falls back to `collection.interval_secs`
    pub interval: Option<u64>,

    /// Seconds before a probe counts as timed out
    pub timeout: Option<u64>,

    /// Status codes counted as healthy; any 2xx when empty
    #[serde(default)]
    pub expected_status: Vec<u16>,

    /// Regex the health response body must match
    pub body_pattern: Option<String>,

    /// JSON analytics endpoint for request/error/latency metrics
    pub metrics_url: Option<String>,
}

impl ServiceConfig {
    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.endpoint.trim_end_matches('/'),
            self.health_path
        )
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub id: Option<String>,
    pub stats_url: String,
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BucketConfig {
    pub name: String,
    pub purpose: Option<String>,
    pub stats_url: String,
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct KvNamespaceConfig {
    pub name: String,
    pub id: Option<String>,
    pub stats_url: String,
    pub interval: Option<u64>,
}

/// Threshold declared in the config file
///
/// Without a `service_name` it is seeded for every target that reports the
/// metric.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ThresholdSeed {
    pub service_name: Option<String>,
    pub metric_type: String,
    pub operator: Operator,
    pub value: f64,
    pub severity: Severity,
    pub webhook_url: Option<String>,
}

impl ThresholdSeed {
    fn new(metric_type: &str, operator: Operator, value: f64, severity: Severity) -> Self {
        Self {
            service_name: None,
            metric_type: metric_type.to_string(),
            operator,
            value,
            severity,
            webhook_url: None,
        }
    }
}

/// Built-in thresholds
pub fn default_thresholds() -> Vec<ThresholdSeed> {
    vec![
        ThresholdSeed::new(metrics::ERROR_RATE, Operator::Gt, 5.0, Severity::Warning),
        ThresholdSeed::new(metrics::ERROR_RATE, Operator::Gt, 10.0, Severity::Critical),
        ThresholdSeed::new(metrics::LATENCY_P95, Operator::Gt, 500.0, Severity::Warning),
        ThresholdSeed::new(metrics::LATENCY_P95, Operator::Gt, 1000.0, Severity::Critical),
        ThresholdSeed::new(metrics::HEALTH_CHECK, Operator::Eq, 0.0, Severity::Critical),
        ThresholdSeed::new(metrics::D1_SIZE_BYTES, Operator::Gt, 8_000_000_000.0, Severity::Warning),
        ThresholdSeed::new(metrics::D1_SIZE_BYTES, Operator::Gt, 9_500_000_000.0, Severity::Critical),
        ThresholdSeed::new(metrics::DAILY_COST_USD, Operator::Gt, 5.0, Severity::Warning),
        ThresholdSeed::new(metrics::DAILY_COST_USD, Operator::Gt, 10.0, Severity::Critical),
    ]
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Destination for thresholds without their own webhook
    pub webhook_url: Option<String>,

    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,

    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "default_alert_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            dashboard_url: default_dashboard_url(),
            max_delivery_attempts: default_max_delivery_attempts(),
            retry_backoff_ms: default_alert_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_collection_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,

    /// Pause before retrying a transient probe failure
    #[serde(default = "default_probe_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_collection_interval(),
            probe_timeout_secs: default_probe_timeout(),
            store_timeout_secs: default_store_timeout(),
            retry_backoff_ms: default_probe_backoff_ms(),
        }
    }
}

impl CollectionConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_aggregator_interval")]
    pub interval_secs: u64,

    /// Oldest sample still used for status; older means `unknown`
    #[serde(default = "default_freshness_horizon")]
    pub freshness_horizon_secs: u64,

    /// How often the evaluator reloads thresholds
    #[serde(default = "default_evaluator_refresh")]
    pub evaluator_refresh_secs: u64,

    /// A collector or aggregator silent for longer is reported as stalled
    #[serde(default = "default_stall_after")]
    pub stall_after_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_aggregator_interval(),
            freshness_horizon_secs: default_freshness_horizon(),
            evaluator_refresh_secs: default_evaluator_refresh(),
            stall_after_secs: default_stall_after(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "crate::util::get_default_api_addr")]
    pub addr: IpAddr,

    #[serde(default = "crate::util::get_default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: crate::util::get_default_api_addr(),
            port: crate::util::get_default_api_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_dashboard_url() -> String {
    "https://monitor.grove.place".to_string()
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_alert_backoff_ms() -> u64 {
    1_000
}

fn default_collection_interval() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_store_timeout() -> u64 {
    5
}

fn default_probe_backoff_ms() -> u64 {
    250
}

fn default_aggregator_interval() -> u64 {
    60
}

fn default_freshness_horizon() -> u64 {
    600
}

fn default_evaluator_refresh() -> u64 {
    30
}

fn default_stall_after() -> u64 {
    900
}

impl Config {
    /// Names of every monitored service
    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Every name samples are recorded under, once each
    ///
    /// A service and its database may share a name; their samples carry
    /// different metric types and roll up into one daily row.
    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.target_classes().into_iter().flatten() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn target_classes(&self) -> [Vec<String>; 4] {
        [
            self.services.iter().map(|s| s.name.clone()).collect(),
            self.databases.iter().map(|d| d.name.clone()).collect(),
            self.buckets.iter().map(|b| b.name.clone()).collect(),
            self.kv_namespaces.iter().map(|k| k.name.clone()).collect(),
        ]
    }

    /// Effective probe interval of every service
    fn service_intervals(&self) -> impl Iterator<Item = (&str, u64)> {
        self.services.iter().map(|s| {
            (
                s.name.as_str(),
                s.interval.unwrap_or(self.collection.interval_secs).max(1),
            )
        })
    }

    /// Settings that start fine but behave badly
    pub fn warnings(&self) -> Vec<String> {
        let horizon = self.aggregator.freshness_horizon_secs;
        self.service_intervals()
            .filter(|(_, interval)| *interval >= horizon)
            .map(|(name, interval)| {
                format!(
                    "service '{name}' is probed every {interval}s but the freshness horizon is {horizon}s, it will show as unknown between probes"
                )
            })
            .collect()
    }

    /// Reject configurations the monitor cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target_names().is_empty() {
            bail!("no monitoring targets configured");
        }

        for class in self.target_classes() {
            let mut seen = std::collections::HashSet::new();
            for name in class {
                if name.trim().is_empty() {
                    bail!("target with empty name configured");
                }
                if !seen.insert(name.clone()) {
                    bail!("target '{name}' configured more than once");
                }
            }
        }

        for service in &self.services {
            if let Some(pattern) = &service.body_pattern {
                Regex::new(pattern).with_context(|| {
                    format!("invalid body_pattern for service '{}'", service.name)
                })?;
            }
        }

        for seed in &self.thresholds {
            if !seed.value.is_finite() {
                bail!("threshold for '{}' has a non-finite value", seed.metric_type);
            }
        }

        Ok(())
    }

    /// Threshold rows to insert into an empty threshold table
    ///
    /// Seeds without a service are expanded to every target reporting the
    /// metric: storage metrics go to their target class, everything else to
    /// services.
    pub fn threshold_rows(&self) -> Vec<NewThreshold> {
        let defaults = if self.seed_default_thresholds {
            default_thresholds()
        } else {
            Vec::new()
        };

        defaults
            .iter()
            .chain(self.thresholds.iter())
            .flat_map(|seed| {
                let targets = match &seed.service_name {
                    Some(name) => vec![name.clone()],
                    None => self.targets_reporting(&seed.metric_type),
                };
                targets.into_iter().map(move |service_name| NewThreshold {
                    service_name,
                    metric_type: seed.metric_type.clone(),
                    operator: seed.operator,
                    threshold_value: seed.value,
                    severity: seed.severity,
                    enabled: true,
                    webhook_url: seed.webhook_url.clone(),
                })
            })
            .collect()
    }

    fn targets_reporting(&self, metric_type: &str) -> Vec<String> {
        match metric_type {
            metrics::D1_SIZE_BYTES | metrics::D1_ROWS_READ | metrics::D1_ROWS_WRITTEN => {
                self.databases.iter().map(|d| d.name.clone()).collect()
            }
            metrics::R2_OBJECT_COUNT | metrics::R2_SIZE_BYTES | metrics::R2_READS
            | metrics::R2_WRITES => self.buckets.iter().map(|b| b.name.clone()).collect(),
            metrics::KV_READS | metrics::KV_WRITES => {
                self.kv_namespaces.iter().map(|k| k.name.clone()).collect()
            }
            metrics::DAILY_COST_USD => self.target_names(),
            _ => self.service_names(),
        }
    }

    /// Apply environment overrides on top of the file
    pub fn apply_env(&mut self) {
        if let Some(enabled) = crate::util::get_alerts_enabled() {
            self.alerts.enabled = enabled;
        }
        if let Some(minutes) = crate::util::get_collection_interval_minutes() {
            self.collection.interval_secs = minutes * 60;
        }
        if let Some(addr) = crate::util::get_api_addr() {
            self.api.addr = addr;
        }
        if let Some(port) = crate::util::get_api_port() {
            self.api.port = port;
        }
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config '{path}'"))?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str(content)
        .context("invalid configuration file provided")
        .inspect(|config| trace!("loaded config: {config:?}"))
}
