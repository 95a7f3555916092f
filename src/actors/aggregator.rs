//! AggregatorActor - Republishes the status cache on a fixed cadence
//!
//! Every cycle derives the whole fleet snapshot from the store and overwrites
//! each cache key. Nothing carries over between cycles, so a failed write or a
//! lost cache heals on the next one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, instrument, trace, warn};

use crate::aggregate::{Aggregator, FleetSnapshot};
use crate::liveness::Liveness;

use super::messages::AggregatorCommand;

pub struct AggregatorActor {
    aggregator: Arc<Aggregator>,
    liveness: Liveness,
    command_rx: mpsc::Receiver<AggregatorCommand>,
    interval_duration: Duration,
}

impl AggregatorActor {
    pub fn new(
        aggregator: Arc<Aggregator>,
        liveness: Liveness,
        command_rx: mpsc::Receiver<AggregatorCommand>,
        interval_duration: Duration,
    ) -> Self {
        Self {
            aggregator,
            liveness,
            command_rx,
            interval_duration,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting aggregator actor");

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!("aggregation cycle failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AggregatorCommand::RunNow { respond_to } => {
                            let result = self.cycle().await;
                            let _ = respond_to.send(result);
                        }

                        AggregatorCommand::Shutdown => {
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

        debug!("aggregator actor stopped");
    }

    async fn cycle(&self) -> Result<FleetSnapshot> {
        let now = Utc::now();
        let snapshot = self
            .aggregator
            .compute(now)
            .await
            .context("failed to derive fleet snapshot")?;

        let outcome = self.aggregator.publish(&snapshot).await;
        if outcome.failed > 0 {
            warn!(
                "{} of {} cache writes failed, retrying next cycle",
                outcome.failed,
                outcome.failed + outcome.written
            );
        }

        self.liveness.aggregator_cycled(Utc::now());
        trace!(
            "published {} services, {} active incidents",
            snapshot.services.len(),
            snapshot.active_incidents.incidents.len()
        );
        Ok(snapshot)
    }
}

/// Handle for controlling the AggregatorActor
#[derive(Clone)]
pub struct AggregatorHandle {
    sender: mpsc::Sender<AggregatorCommand>,
}

impl AggregatorHandle {
    pub fn spawn(aggregator: Arc<Aggregator>, liveness: Liveness, interval_duration: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = AggregatorActor::new(aggregator, liveness, cmd_rx, interval_duration);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Run one cycle now and return the snapshot it published
    pub async fn run_now(&self) -> Result<FleetSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregatorCommand::RunNow { respond_to: tx })
            .await
            .context("failed to send RunNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(AggregatorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
