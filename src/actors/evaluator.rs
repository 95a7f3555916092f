//! EvaluatorActor - Checks every stored observation against the thresholds
//!
//! Subscribes to [`SampleEvent`]s and hands each outcome to the
//! [`IncidentManager`] in arrival order. The threshold snapshot is reloaded
//! before the first event and then on a fixed tick, so edits to the threshold
//! table are picked up without a restart.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::evaluation::{Evaluation, ThresholdSource, evaluate};
use crate::incident::IncidentManager;
use crate::storage::AlertThreshold;

use super::messages::{EvaluatorCommand, SampleEvent};

pub struct EvaluatorActor {
    source: Arc<dyn ThresholdSource>,
    thresholds: Vec<AlertThreshold>,
    incidents: Arc<IncidentManager>,
    sample_rx: broadcast::Receiver<SampleEvent>,
    command_rx: mpsc::Receiver<EvaluatorCommand>,
    refresh_every: Duration,

    /// Outcomes are dropped until this instant
    muted_until: Option<Instant>,
}

impl EvaluatorActor {
    pub fn new(
        source: Arc<dyn ThresholdSource>,
        incidents: Arc<IncidentManager>,
        sample_rx: broadcast::Receiver<SampleEvent>,
        command_rx: mpsc::Receiver<EvaluatorCommand>,
        refresh_every: Duration,
    ) -> Self {
        Self {
            source,
            thresholds: Vec::new(),
            incidents,
            sample_rx,
            command_rx,
            refresh_every,
            muted_until: None,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting evaluator actor");

        if let Err(e) = self.refresh().await {
            error!("initial threshold load failed: {:#}", e);
        }

        let mut ticker = interval(self.refresh_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The snapshot was just loaded
        ticker.reset();

        loop {
            tokio::select! {
                result = self.sample_rx.recv() => {
                    match result {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("evaluator lagged, skipped {skipped} sample events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("sample channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        // Keep evaluating against the previous snapshot
                        warn!("threshold refresh failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        EvaluatorCommand::Mute { duration_secs } => {
                            info!("muting alerts for {duration_secs}s");
                            self.muted_until = Some(Instant::now() + Duration::from_secs(duration_secs));
                        }

                        EvaluatorCommand::Unmute => {
                            info!("unmuting alerts");
                            self.muted_until = None;
                        }

                        EvaluatorCommand::RefreshThresholds { respond_to } => {
                            let result = self.refresh().await;
                            let _ = respond_to.send(result);
                        }

                        EvaluatorCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }
            }
        }

        debug!("evaluator actor stopped");
    }

    async fn refresh(&mut self) -> Result<usize> {
        let thresholds = self
            .source
            .snapshot()
            .await
            .context("failed to load thresholds")?;

        let mut valid = Vec::with_capacity(thresholds.len());
        for threshold in thresholds {
            match threshold.validate() {
                Ok(()) => valid.push(threshold),
                Err(e) => warn!(threshold_id = threshold.id, "skipping threshold: {}", e),
            }
        }

        trace!("loaded {} thresholds", valid.len());
        self.thresholds = valid;
        Ok(self.thresholds.len())
    }

    fn is_muted(&mut self) -> bool {
        match self.muted_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                info!("mute window elapsed");
                self.muted_until = None;
                false
            }
            None => false,
        }
    }

    async fn handle_event(&mut self, event: SampleEvent) {
        if self.is_muted() {
            trace!("muted, ignoring sample {}", event.sample.id);
            return;
        }

        for observation in event.sample.observations() {
            let evaluation = evaluate(
                &self.thresholds,
                &observation.service_name,
                &observation.metric_type,
                observation.value,
            );

            if matches!(evaluation, Evaluation::NotConfigured) {
                continue;
            }

            if let Err(e) = self.incidents.handle(evaluation).await {
                error!(
                    "incident update failed for {}/{}: {}",
                    observation.service_name, observation.metric_type, e
                );
            }
        }
    }
}

/// Handle for controlling the EvaluatorActor
#[derive(Clone)]
pub struct EvaluatorHandle {
    sender: mpsc::Sender<EvaluatorCommand>,
}

impl EvaluatorHandle {
    /// Spawn the evaluator with a fresh subscription to `sample_tx`
    pub fn spawn(
        source: Arc<dyn ThresholdSource>,
        incidents: Arc<IncidentManager>,
        sample_tx: &broadcast::Sender<SampleEvent>,
        refresh_every: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = EvaluatorActor::new(
            source,
            incidents,
            sample_tx.subscribe(),
            cmd_rx,
            refresh_every,
        );

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn mute(&self, duration_secs: u64) -> Result<()> {
        self.sender
            .send(EvaluatorCommand::Mute { duration_secs })
            .await
            .context("failed to send Mute command")?;
        Ok(())
    }

    pub async fn unmute(&self) -> Result<()> {
        self.sender
            .send(EvaluatorCommand::Unmute)
            .await
            .context("failed to send Unmute command")?;
        Ok(())
    }

    /// Reload thresholds now; returns how many are in effect
    pub async fn refresh_thresholds(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(EvaluatorCommand::RefreshThresholds { respond_to: tx })
            .await
            .context("failed to send RefreshThresholds command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(EvaluatorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
