//! Fleet health monitoring core.
//!
//! Collectors probe services, databases, buckets and KV namespaces and append
//! samples to a [`storage::SampleStore`]. The threshold evaluator turns fresh
//! samples into alert candidates, the [`incident::IncidentManager`] drives the
//! incident lifecycle, and the aggregator keeps a TTL-bounded projection of the
//! fleet in a [`cache::StatusCache`].

pub mod actors;
pub mod aggregate;
pub mod api;
pub mod cache;
pub mod config;
pub mod evaluation;
pub mod incident;
pub mod liveness;
pub mod metrics;
pub mod notify;
pub mod probes;
pub mod storage;
pub mod util;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Alert severity.
///
/// Ordering follows [`Severity::rank`]: `critical > warning > info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Info, Severity::Warning, Severity::Critical];

    /// Fixed rank used for every severity comparison.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Comparison applied between a current value and a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Gt,
    Lt,
    Eq,
}

impl Operator {
    /// Does `current <op> threshold` hold?
    ///
    /// `eq` tolerates float noise so that stored booleans (`health_check eq 0`)
    /// compare as expected.
    pub fn apply(self, current: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => current > threshold,
            Operator::Lt => current < threshold,
            Operator::Eq => {
                let scale = threshold.abs().max(1.0);
                (current - threshold).abs() <= f64::EPSILON * scale
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Gt => "gt",
            Operator::Lt => "lt",
            Operator::Eq => "eq",
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Eq => "==",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gt" => Ok(Operator::Gt),
            "lt" => Ok(Operator::Lt),
            "eq" => Ok(Operator::Eq),
            other => Err(format!("unknown operator '{other}'")),
        }
    }
}

/// Derived health of a monitored service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Down,
    /// No sample inside the freshness horizon.
    Unknown,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Down => "down",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
