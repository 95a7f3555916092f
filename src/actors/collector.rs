//! CollectorActor - Probes one target on its own timer
//!
//! Each (target, probe kind) pair gets its own actor, so a slow or failing
//! target never delays another.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → Probe target → Store samples → Publish SampleEvent → [EvaluatorActor, ...]
//!     ↑
//!     └─── Commands (ProbeNow, UpdateInterval, Shutdown)
//! ```
//!
//! A failed probe is not an error here: the probe's failure samples are stored
//! and published like any other observation. Only store writes that still fail
//! after retrying make a run unsuccessful.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, instrument, trace, warn};

use crate::liveness::Liveness;
use crate::probes::{Probe, ProbeFailure};
use crate::storage::{NewSample, Sample, SampleStore, StorageResult, with_timeout};
use crate::util::backoff_delay;

use super::messages::{CollectionReport, CollectorCommand, SampleEvent};

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub interval: Duration,

    /// Bound on a single probe attempt
    pub probe_timeout: Duration,

    /// Wait before retrying a transient probe failure, and the base delay
    /// between store write attempts
    pub retry_backoff: Duration,

    pub store_timeout: Duration,
    pub store_attempts: u32,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(250),
            store_timeout: Duration::from_secs(5),
            store_attempts: 3,
        }
    }
}

/// Actor that probes a single target
pub struct CollectorActor {
    probe: Arc<dyn Probe>,
    store: Arc<dyn SampleStore>,
    command_rx: mpsc::Receiver<CollectorCommand>,
    sample_tx: broadcast::Sender<SampleEvent>,
    liveness: Liveness,
    settings: CollectorSettings,

    /// `name:kind`, used for logging and liveness
    collector_id: String,
}

impl CollectorActor {
    pub fn new(
        probe: Arc<dyn Probe>,
        store: Arc<dyn SampleStore>,
        command_rx: mpsc::Receiver<CollectorCommand>,
        sample_tx: broadcast::Sender<SampleEvent>,
        liveness: Liveness,
        settings: CollectorSettings,
    ) -> Self {
        let collector_id = probe.target().collector_id();
        liveness.register_collector(&collector_id, settings.interval);

        Self {
            probe,
            store,
            command_rx,
            sample_tx,
            liveness,
            settings,
            collector_id,
        }
    }

    /// Run until a Shutdown command arrives or every handle is dropped
    #[instrument(skip(self), fields(collector = %self.collector_id))]
    pub async fn run(mut self) {
        debug!("starting collector actor");

        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        error!("collection failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        CollectorCommand::ProbeNow { respond_to } => {
                            debug!("received ProbeNow command");
                            let result = self.collect().await;
                            let _ = respond_to.send(result);
                        }

                        CollectorCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.settings.interval = Duration::from_secs(interval_secs.max(1));
                            self.liveness
                                .register_collector(&self.collector_id, self.settings.interval);
                            ticker = self.ticker();
                            // The fresh ticker fires at once; the last run was just now
                            ticker.reset();
                        }

                        CollectorCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("collector actor stopped");
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Probe once, store what came back and publish it
    async fn collect(&self) -> Result<CollectionReport> {
        let mut report = CollectionReport::default();

        let samples = match self.probe_with_retry().await {
            Ok(samples) => samples,
            Err(failure) => {
                warn!("probe of {} failed: {}", self.probe.target().url, failure);
                report.probe_failed = true;
                self.probe.failure_samples(&failure, Utc::now())
            }
        };

        for sample in samples {
            match self.store_with_retry(&sample).await {
                Ok(id) => {
                    report.stored += 1;
                    self.publish(Sample { id, data: sample });
                }
                Err(e) => {
                    report.failed_writes += 1;
                    error!(
                        "store write failed for {} after {} attempts: {}",
                        sample.subject(),
                        self.settings.store_attempts,
                        e
                    );
                }
            }
        }

        if report.failed_writes > 0 {
            anyhow::bail!(
                "{} of {} samples were not stored",
                report.failed_writes,
                report.failed_writes + report.stored
            );
        }

        self.liveness.collector_succeeded(&self.collector_id, Utc::now());
        trace!("stored {} samples", report.stored);
        Ok(report)
    }

    /// One attempt, plus one more after a short pause if the failure was transient
    async fn probe_with_retry(&self) -> Result<Vec<NewSample>, ProbeFailure> {
        match self.attempt().await {
            Err(failure) if failure.is_transient() => {
                debug!("transient probe failure, retrying: {}", failure);
                tokio::time::sleep(self.settings.retry_backoff).await;
                self.attempt().await
            }
            result => result,
        }
    }

    async fn attempt(&self) -> Result<Vec<NewSample>, ProbeFailure> {
        tokio::time::timeout(self.settings.probe_timeout, self.probe.probe())
            .await
            .unwrap_or(Err(ProbeFailure::Timeout))
    }

    async fn store_with_retry(&self, sample: &NewSample) -> StorageResult<i64> {
        let attempts = self.settings.store_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = with_timeout(
                self.settings.store_timeout,
                self.store.append(sample.clone()),
            )
            .await;

            match result {
                Ok(id) => return Ok(id),
                Err(e) if attempt < attempts && e.is_transient() => {
                    let delay = backoff_delay(self.settings.retry_backoff, attempt);
                    warn!("store write attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self, sample: Sample) {
        let event = SampleEvent {
            sample,
            source: self.collector_id.clone(),
        };

        // No subscribers is fine; the sample is already stored
        match self.sample_tx.send(event) {
            Ok(receivers) => trace!("published sample event to {receivers} receivers"),
            Err(_) => trace!("no receivers for sample event"),
        }
    }
}

/// Handle for controlling a CollectorActor
#[derive(Clone)]
pub struct CollectorHandle {
    sender: mpsc::Sender<CollectorCommand>,
    pub collector_id: String,
}

impl CollectorHandle {
    /// Create the actor and spawn it as a tokio task
    pub fn spawn(
        probe: Arc<dyn Probe>,
        store: Arc<dyn SampleStore>,
        sample_tx: broadcast::Sender<SampleEvent>,
        liveness: Liveness,
        settings: CollectorSettings,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = CollectorActor::new(probe, store, cmd_rx, sample_tx, liveness, settings);
        let collector_id = actor.collector_id.clone();

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            collector_id,
        }
    }

    /// Probe immediately, bypassing the interval timer
    pub async fn probe_now(&self) -> Result<CollectionReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::ProbeNow { respond_to: tx })
            .await
            .context("failed to send ProbeNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(CollectorCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CollectorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
