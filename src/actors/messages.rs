//! Message types for actor communication
//!
//! Commands go to one actor through its mpsc channel and may carry a oneshot
//! sender for the reply. Events are broadcast and cloned to every subscriber.

use chrono::NaiveDate;
use tokio::sync::oneshot;

use crate::aggregate::FleetSnapshot;
use crate::storage::Sample;

/// Published once per stored sample
///
/// The broadcast channel may lag for slow subscribers. The sample is already
/// durable when the event goes out, so a dropped event loses an evaluation,
/// never data.
#[derive(Debug, Clone)]
pub struct SampleEvent {
    pub sample: Sample,

    /// Collector that produced the sample (`name:kind`)
    pub source: String,
}

/// Outcome of one collection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionReport {
    pub stored: usize,
    pub failed_writes: usize,

    /// The probe itself failed and failure samples were recorded instead
    pub probe_failed: bool,
}

/// Commands that can be sent to a CollectorActor
#[derive(Debug)]
pub enum CollectorCommand {
    /// Probe immediately, bypassing the interval timer
    ProbeNow {
        respond_to: oneshot::Sender<anyhow::Result<CollectionReport>>,
    },

    /// Takes effect from the next tick
    UpdateInterval { interval_secs: u64 },

    /// Finish the in-flight probe and exit
    Shutdown,
}

/// Commands that can be sent to the EvaluatorActor
#[derive(Debug)]
pub enum EvaluatorCommand {
    /// Stop forwarding outcomes for a while, e.g. during maintenance
    Mute { duration_secs: u64 },

    Unmute,

    /// Reload the threshold snapshot now, replying with its size
    RefreshThresholds {
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    Shutdown,
}

/// Commands that can be sent to the AggregatorActor
#[derive(Debug)]
pub enum AggregatorCommand {
    /// Run one cycle now and reply with what was published
    RunNow {
        respond_to: oneshot::Sender<anyhow::Result<FleetSnapshot>>,
    },

    Shutdown,
}

/// Commands that can be sent to the RollupActor
#[derive(Debug)]
pub enum RollupCommand {
    /// Finalize one day immediately, replying with the number of new rows
    Finalize {
        date: NaiveDate,
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    Shutdown,
}
