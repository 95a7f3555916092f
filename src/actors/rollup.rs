//! RollupActor - Daily totals, cost estimates and sample retention
//!
//! Once an hour the actor finalizes the previous UTC day for every target that
//! has not been finalized yet, then deletes samples older than the retention
//! window. Finalizing is insert-if-absent, so repeating it is harmless.
//!
//! Each new daily row also yields a `daily_cost_usd` metric sample, which is
//! stored and published so cost thresholds are evaluated like any other.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::metrics;
use crate::storage::{DailyAggregate, Metric, NewSample, Sample, SampleStore, with_timeout};

use super::messages::{RollupCommand, SampleEvent};

/// USD per million units, rough list prices
pub mod prices {
    pub const REQUESTS: f64 = 0.30;
    pub const D1_ROWS_READ: f64 = 0.001;
    pub const D1_ROWS_WRITTEN: f64 = 1.00;
    pub const R2_READS: f64 = 0.36;
    pub const R2_WRITES: f64 = 4.50;
    pub const KV_READS: f64 = 0.50;
    pub const KV_WRITES: f64 = 5.00;
}

#[derive(Debug, Clone)]
pub struct RollupSettings {
    pub check_every: Duration,

    /// Samples older than this many days are deleted; 0 keeps everything
    pub retention_days: u32,

    pub store_timeout: Duration,
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            check_every: Duration::from_secs(3600),
            retention_days: 30,
            store_timeout: Duration::from_secs(5),
        }
    }
}

pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

fn total(samples: &[Sample], metric_type: &str) -> u64 {
    samples
        .iter()
        .filter_map(|sample| sample.value_of(metric_type))
        .map(|value| value.max(0.0).round() as u64)
        .sum()
}

/// Fold one day of a target's samples into its daily row
///
/// Request, read and write figures are per-interval counts, so the day's
/// total is their sum.
pub fn daily_aggregate(target: &str, date: NaiveDate, samples: &[Sample]) -> DailyAggregate {
    let mut aggregate = DailyAggregate {
        date,
        service_name: target.to_string(),
        total_requests: total(samples, metrics::REQUESTS),
        total_errors: total(samples, metrics::ERRORS),
        total_d1_reads: total(samples, metrics::D1_ROWS_READ),
        total_d1_writes: total(samples, metrics::D1_ROWS_WRITTEN),
        total_r2_reads: total(samples, metrics::R2_READS),
        total_r2_writes: total(samples, metrics::R2_WRITES),
        total_kv_reads: total(samples, metrics::KV_READS),
        total_kv_writes: total(samples, metrics::KV_WRITES),
        estimated_cost_usd: 0.0,
    };
    aggregate.estimated_cost_usd = estimate_cost(&aggregate);
    aggregate
}

pub fn estimate_cost(aggregate: &DailyAggregate) -> f64 {
    let per_million = |count: u64, price: f64| count as f64 / 1_000_000.0 * price;

    per_million(aggregate.total_requests, prices::REQUESTS)
        + per_million(aggregate.total_d1_reads, prices::D1_ROWS_READ)
        + per_million(aggregate.total_d1_writes, prices::D1_ROWS_WRITTEN)
        + per_million(aggregate.total_r2_reads, prices::R2_READS)
        + per_million(aggregate.total_r2_writes, prices::R2_WRITES)
        + per_million(aggregate.total_kv_reads, prices::KV_READS)
        + per_million(aggregate.total_kv_writes, prices::KV_WRITES)
}

/// Daily finalization and retention over the sample store
pub struct Rollup {
    store: Arc<dyn SampleStore>,
    targets: Vec<String>,
    sample_tx: broadcast::Sender<SampleEvent>,
    settings: RollupSettings,
}

impl Rollup {
    pub fn new(
        store: Arc<dyn SampleStore>,
        targets: Vec<String>,
        sample_tx: broadcast::Sender<SampleEvent>,
        settings: RollupSettings,
    ) -> Self {
        Self {
            store,
            targets,
            sample_tx,
            settings,
        }
    }

    /// Write the daily row for every target that has samples on `date`
    ///
    /// Returns the number of rows written by this call.
    #[instrument(skip(self))]
    pub async fn finalize(&self, date: NaiveDate) -> Result<usize> {
        let timeout = self.settings.store_timeout;
        let (start, end) = day_bounds(date);
        let mut written = 0;

        for target in &self.targets {
            if with_timeout(timeout, self.store.get_daily_aggregate(date, target))
                .await?
                .is_some()
            {
                trace!("{target} already finalized for {date}");
                continue;
            }

            let samples = with_timeout(timeout, self.store.query_range(target, start, end))
                .await
                .with_context(|| format!("failed to read samples of {target}"))?;
            if samples.is_empty() {
                continue;
            }

            let aggregate = daily_aggregate(target, date, &samples);
            let cost = aggregate.estimated_cost_usd;

            if !with_timeout(timeout, self.store.insert_daily_aggregate(aggregate)).await? {
                // Another writer got there first
                continue;
            }
            written += 1;
            debug!("finalized {target} for {date}, estimated ${cost:.4}");

            self.record_cost(target, date, cost).await;
        }

        if written > 0 {
            info!("finalized {} daily aggregates for {}", written, date);
        }
        Ok(written)
    }

    async fn record_cost(&self, target: &str, date: NaiveDate, cost: f64) {
        let sample = NewSample::Metric(Metric {
            service_name: target.to_string(),
            metric_type: metrics::DAILY_COST_USD.to_string(),
            value: cost,
            unit: Some("usd".to_string()),
            recorded_at: Utc::now(),
            metadata: Some(serde_json::json!({ "date": date.to_string() })),
        });

        match with_timeout(self.settings.store_timeout, self.store.append(sample.clone())).await {
            Ok(id) => {
                let _ = self.sample_tx.send(SampleEvent {
                    sample: Sample { id, data: sample },
                    source: format!("{target}:rollup"),
                });
            }
            Err(e) => warn!("failed to record daily cost of {}: {}", target, e),
        }
    }

    /// Delete samples past the retention window
    #[instrument(skip(self))]
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        if self.settings.retention_days == 0 {
            return Ok(0);
        }

        let before = now - chrono::Duration::days(i64::from(self.settings.retention_days));
        let deleted = with_timeout(
            self.settings.store_timeout,
            self.store.cleanup_samples_before(before),
        )
        .await
        .context("failed to clean up old samples")?;

        if deleted > 0 {
            info!("deleted {} samples older than {}", deleted, before);
        }
        Ok(deleted)
    }
}

pub struct RollupActor {
    rollup: Rollup,
    command_rx: mpsc::Receiver<RollupCommand>,
}

impl RollupActor {
    pub fn new(rollup: Rollup, command_rx: mpsc::Receiver<RollupCommand>) -> Self {
        Self { rollup, command_rx }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting rollup actor");

        let mut ticker = interval(self.rollup.settings.check_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RollupCommand::Finalize { date, respond_to } => {
                            let result = self.rollup.finalize(date).await;
                            let _ = respond_to.send(result);
                        }

                        RollupCommand::Shutdown => {
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

        debug!("rollup actor stopped");
    }

    async fn tick(&self) {
        let now = Utc::now();
        if let Some(yesterday) = now.date_naive().pred_opt() {
            if let Err(e) = self.rollup.finalize(yesterday).await {
                error!("daily rollup failed: {:#}", e);
            }
        }
        if let Err(e) = self.rollup.cleanup(now).await {
            error!("retention cleanup failed: {:#}", e);
        }
    }
}

#[derive(Clone)]
pub struct RollupHandle {
    sender: mpsc::Sender<RollupCommand>,
}

impl RollupHandle {
    pub fn spawn(rollup: Rollup) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        tokio::spawn(RollupActor::new(rollup, cmd_rx).run());
        Self { sender: cmd_tx }
    }

    /// Finalize `date` now; returns the number of rows written
    pub async fn finalize(&self, date: NaiveDate) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RollupCommand::Finalize {
                date,
                respond_to: tx,
            })
            .await
            .context("failed to send Finalize command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(RollupCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageStat, StorageTargetKind};
    use pretty_assertions::assert_eq;

    fn metric(service: &str, metric_type: &str, value: f64, at: DateTime<Utc>) -> NewSample {
        NewSample::Metric(Metric {
            service_name: service.to_string(),
            metric_type: metric_type.to_string(),
            value,
            unit: None,
            recorded_at: at,
            metadata: None,
        })
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn test_cost_estimate() {
        let aggregate = DailyAggregate {
            date: date(),
            service_name: "scout".to_string(),
            total_requests: 2_000_000,
            total_errors: 0,
            total_d1_reads: 0,
            total_d1_writes: 1_000_000,
            total_r2_reads: 0,
            total_r2_writes: 0,
            total_kv_reads: 0,
            total_kv_writes: 0,
            estimated_cost_usd: 0.0,
        };
        let cost = estimate_cost(&aggregate);
        assert!((cost - 1.6).abs() < 1e-9, "got {cost}");
    }

    #[tokio::test]
    async fn test_finalize_sums_day_and_records_cost() {
        let store = Arc::new(MemoryBackend::new());
        let (start, end) = day_bounds(date());
        let (sample_tx, mut sample_rx) = broadcast::channel(16);

        store.append(metric("scout", metrics::REQUESTS, 1000.0, start)).await.unwrap();
        store
            .append(metric("scout", metrics::REQUESTS, 500.0, start + chrono::Duration::hours(12)))
            .await
            .unwrap();
        store.append(metric("scout", metrics::ERRORS, 12.0, start)).await.unwrap();
        // The next day belongs to the next row
        store.append(metric("scout", metrics::REQUESTS, 9999.0, end)).await.unwrap();
        store
            .append(NewSample::StorageStat(StorageStat {
                target_name: "scout-db".to_string(),
                target_kind: StorageTargetKind::Database,
                size_bytes: Some(1024),
                object_count: None,
                reads: Some(40_000),
                writes: Some(300),
                recorded_at: start + chrono::Duration::hours(1),
            }))
            .await
            .unwrap();

        let rollup = Rollup::new(
            store.clone(),
            vec!["scout".to_string(), "scout-db".to_string(), "idle".to_string()],
            sample_tx,
            RollupSettings::default(),
        );

        assert_eq!(rollup.finalize(date()).await.unwrap(), 2);

        let scout = store.get_daily_aggregate(date(), "scout").await.unwrap().unwrap();
        assert_eq!(scout.total_requests, 1500);
        assert_eq!(scout.total_errors, 12);

        let db = store.get_daily_aggregate(date(), "scout-db").await.unwrap().unwrap();
        assert_eq!(db.total_d1_reads, 40_000);
        assert_eq!(db.total_d1_writes, 300);

        assert!(store.get_daily_aggregate(date(), "idle").await.unwrap().is_none());

        let event = sample_rx.recv().await.unwrap();
        assert_eq!(event.sample.metric_type(), Some(metrics::DAILY_COST_USD));

        // A second pass writes nothing new
        assert_eq!(rollup.finalize(date()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let store = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        let (sample_tx, _) = broadcast::channel(16);

        store
            .append(metric("scout", metrics::REQUESTS, 1.0, now - chrono::Duration::days(45)))
            .await
            .unwrap();
        store
            .append(metric("scout", metrics::REQUESTS, 1.0, now - chrono::Duration::days(2)))
            .await
            .unwrap();

        let rollup = Rollup::new(store.clone(), vec!["scout".to_string()], sample_tx, RollupSettings::default());
        assert_eq!(rollup.cleanup(now).await.unwrap(), 1);

        let remaining = store
            .query_range("scout", now - chrono::Duration::days(60), now)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_finalize() {
        let store = Arc::new(MemoryBackend::new());
        let (start, _) = day_bounds(date());
        store.append(metric("scout", metrics::REQUESTS, 10.0, start)).await.unwrap();

        let (sample_tx, _) = broadcast::channel(16);
        let handle = RollupHandle::spawn(Rollup::new(
            store.clone(),
            vec!["scout".to_string()],
            sample_tx,
            RollupSettings::default(),
        ));

        assert_eq!(handle.finalize(date()).await.unwrap(), 1);
        handle.shutdown().await.unwrap();
    }
}
