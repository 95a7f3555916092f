//! Threshold evaluation
//!
//! Evaluation is a pure function of a threshold snapshot and one observation.
//! For a given `(service, metric)` every enabled, valid threshold is checked;
//! the matching threshold with the highest severity rank wins and lower
//! matches are suppressed. When thresholds exist but none matches, the outcome
//! is [`Evaluation::Cleared`], which is what lets the incident manager retire
//! incidents.
//!
//! Ties between matching thresholds of the same severity go to the operator
//! (`gt` before `lt` before `eq`), then to the most extreme threshold value for
//! that operator (highest for `gt`, lowest for `lt`), then to the lowest id, so
//! the decision never depends on row order.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::storage::{AlertThreshold, SampleStore, StorageResult};
use crate::{Operator, Severity};

/// A threshold condition currently holds for `(service_name, metric_type)`
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub service_name: String,
    pub metric_type: String,
    pub severity: Severity,
    pub current_value: f64,
    pub threshold_value: f64,
    pub operator: Operator,

    /// Per-threshold override of the notification destination
    pub webhook_url: Option<String>,
}

impl AlertCandidate {
    pub fn describe(&self) -> String {
        format!(
            "{} {} is {} ({} {})",
            self.service_name,
            self.metric_type,
            self.current_value,
            self.operator.symbol(),
            self.threshold_value
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Highest-severity matching threshold
    Matched(AlertCandidate),

    /// Thresholds exist for the key and none of them holds
    Cleared {
        service_name: String,
        metric_type: String,
        current_value: f64,
    },

    /// No enabled threshold is configured for the key
    NotConfigured,
}

impl Evaluation {
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Evaluation::Matched(candidate) => Some(candidate.severity),
            _ => None,
        }
    }
}

/// Why a threshold row cannot take part in evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdError {
    EmptyServiceName,
    EmptyMetricType,
    NonFiniteValue(f64),
}

impl fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdError::EmptyServiceName => write!(f, "threshold has no service name"),
            ThresholdError::EmptyMetricType => write!(f, "threshold has no metric type"),
            ThresholdError::NonFiniteValue(value) => {
                write!(f, "threshold value {} is not a finite number", value)
            }
        }
    }
}

impl std::error::Error for ThresholdError {}

impl AlertThreshold {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if self.service_name.trim().is_empty() {
            return Err(ThresholdError::EmptyServiceName);
        }
        if self.metric_type.trim().is_empty() {
            return Err(ThresholdError::EmptyMetricType);
        }
        if !self.threshold_value.is_finite() {
            return Err(ThresholdError::NonFiniteValue(self.threshold_value));
        }
        Ok(())
    }

    fn applies_to(&self, service_name: &str, metric_type: &str) -> bool {
        self.enabled && self.service_name == service_name && self.metric_type == metric_type
    }
}

/// Order two matching thresholds; `Greater` means `a` wins.
///
/// Severity first, then operator (gt, lt, eq), then the more extreme value
/// for that operator, then the lowest id. Every step is a total order so the
/// winner never depends on row order.
fn precedence(a: &AlertThreshold, b: &AlertThreshold) -> Ordering {
    fn operator_rank(op: Operator) -> u8 {
        match op {
            Operator::Gt => 2,
            Operator::Lt => 1,
            Operator::Eq => 0,
        }
    }

    a.severity
        .cmp(&b.severity)
        .then_with(|| operator_rank(a.operator).cmp(&operator_rank(b.operator)))
        .then_with(|| {
            let extremity = a.threshold_value.total_cmp(&b.threshold_value);
            match a.operator {
                Operator::Gt => extremity,
                Operator::Lt => extremity.reverse(),
                Operator::Eq => Ordering::Equal,
            }
        })
        .then_with(|| b.id.cmp(&a.id))
}

/// Evaluate one observation against a threshold snapshot
pub fn evaluate(
    thresholds: &[AlertThreshold],
    service_name: &str,
    metric_type: &str,
    current_value: f64,
) -> Evaluation {
    let mut configured = false;
    let mut winner: Option<&AlertThreshold> = None;

    for threshold in thresholds
        .iter()
        .filter(|t| t.applies_to(service_name, metric_type))
    {
        if let Err(e) = threshold.validate() {
            warn!(threshold_id = threshold.id, "skipping threshold: {}", e);
            continue;
        }
        configured = true;

        if !threshold
            .operator
            .apply(current_value, threshold.threshold_value)
        {
            continue;
        }

        winner = match winner {
            Some(current) if precedence(current, threshold) != Ordering::Less => Some(current),
            _ => Some(threshold),
        };
    }

    match winner {
        Some(threshold) => Evaluation::Matched(AlertCandidate {
            service_name: service_name.to_string(),
            metric_type: metric_type.to_string(),
            severity: threshold.severity,
            current_value,
            threshold_value: threshold.threshold_value,
            operator: threshold.operator,
            webhook_url: threshold.webhook_url.clone(),
        }),
        None if configured => Evaluation::Cleared {
            service_name: service_name.to_string(),
            metric_type: metric_type.to_string(),
            current_value,
        },
        None => Evaluation::NotConfigured,
    }
}

/// Are any enabled, valid thresholds configured for the key?
pub fn has_thresholds(thresholds: &[AlertThreshold], service_name: &str, metric_type: &str) -> bool {
    thresholds
        .iter()
        .any(|t| t.applies_to(service_name, metric_type) && t.validate().is_ok())
}

/// Read-only source of threshold snapshots
#[async_trait]
pub trait ThresholdSource: Send + Sync {
    async fn snapshot(&self) -> StorageResult<Vec<AlertThreshold>>;
}

/// Thresholds read straight from the sample store's threshold table
pub struct StoreThresholdSource {
    store: Arc<dyn SampleStore>,
}

impl StoreThresholdSource {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ThresholdSource for StoreThresholdSource {
    async fn snapshot(&self) -> StorageResult<Vec<AlertThreshold>> {
        self.store.list_thresholds().await
    }
}

/// Fixed threshold list, used where thresholds come from configuration only
pub struct StaticThresholds(pub Vec<AlertThreshold>);

#[async_trait]
impl ThresholdSource for StaticThresholds {
    async fn snapshot(&self) -> StorageResult<Vec<AlertThreshold>> {
        Ok(self.0.clone())
    }
}
