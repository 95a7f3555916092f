//! Self-monitoring: when did each loop last complete?
//!
//! Collectors mark a success after storing a probe's samples and the
//! aggregator marks every finished cycle. An operator polls the report to
//! find out whether the monitor itself has stalled.
//!
//! A collector may stay silent for `max(stall_after, 2 × interval)`, so a
//! slow on-schedule collector is never reported as stalled.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default)]
struct CollectorState {
    interval: Duration,
    last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    collectors: BTreeMap<String, CollectorState>,
    aggregator: Option<DateTime<Utc>>,
}

/// Shared liveness timestamps
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    state: Arc<RwLock<State>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorLiveness {
    pub last_success: Option<DateTime<Utc>>,
    pub interval_secs: u64,
    pub stalled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessReport {
    pub collectors: BTreeMap<String, CollectorLiveness>,
    pub last_aggregator_cycle: Option<DateTime<Utc>>,
    pub aggregator_stalled: bool,

    /// Any collector or the aggregator is stalled
    pub stalled: bool,
    pub generated_at: DateTime<Utc>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a collector known before its first success, or record a new
    /// interval for it
    pub fn register_collector(&self, id: &str, interval: Duration) {
        if let Ok(mut state) = self.state.write() {
            state.collectors.entry(id.to_string()).or_default().interval = interval;
        }
    }

    pub fn collector_succeeded(&self, id: &str, at: DateTime<Utc>) {
        if let Ok(mut state) = self.state.write() {
            state.collectors.entry(id.to_string()).or_default().last_success = Some(at);
        }
    }

    pub fn aggregator_cycled(&self, at: DateTime<Utc>) {
        if let Ok(mut state) = self.state.write() {
            state.aggregator = Some(at);
        }
    }

    /// Everything silent for longer than its bound counts as stalled,
    /// including loops that never completed
    pub fn report(&self, now: DateTime<Utc>, stall_after: Duration) -> LivenessReport {
        let is_stalled = |at: Option<DateTime<Utc>>, bound: Duration| {
            let bound = chrono::Duration::from_std(bound).unwrap_or(chrono::Duration::MAX);
            at.is_none_or(|at| now - at > bound)
        };

        let (collectors, aggregator) = match self.state.read() {
            Ok(state) => (state.collectors.clone(), state.aggregator),
            Err(poisoned) => {
                let state = poisoned.into_inner();
                (state.collectors.clone(), state.aggregator)
            }
        };

        let collectors: BTreeMap<String, CollectorLiveness> = collectors
            .into_iter()
            .map(|(id, collector)| {
                let bound = stall_after.max(collector.interval.saturating_mul(2));
                (
                    id,
                    CollectorLiveness {
                        last_success: collector.last_success,
                        interval_secs: collector.interval.as_secs(),
                        stalled: is_stalled(collector.last_success, bound),
                    },
                )
            })
            .collect();

        let aggregator_stalled = is_stalled(aggregator, stall_after);
        let stalled = aggregator_stalled || collectors.values().any(|c| c.stalled);

        LivenessReport {
            collectors,
            last_aggregator_cycle: aggregator,
            aggregator_stalled,
            stalled,
            generated_at: now,
        }
    }
}
