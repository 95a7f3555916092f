//! In-memory sample store (no persistence)
//!
//! This backend keeps everything in process memory.
//! It's useful for:
//! - Testing without database dependencies
//! - Deployments that only care about the live status projection
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Bounded history**: At most `MAX_SAMPLES_PER_SUBJECT` samples per subject

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::backend::{HealthStatus, SampleStore};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AlertThreshold, DailyAggregate, Incident, IncidentId, NewIncident, NewSample, NewThreshold,
    Sample, SampleId,
};

/// Maximum samples kept per subject before the oldest are evicted
const MAX_SAMPLES_PER_SUBJECT: usize = 50_000;

#[derive(Default)]
struct Tables {
    incidents: Vec<Incident>,
    thresholds: Vec<AlertThreshold>,
    daily: HashMap<(NaiveDate, String), DailyAggregate>,
}

/// In-memory sample store
///
/// Samples are sharded per subject, so appends for different targets never
/// contend. Incidents, thresholds and rollups share one short-lived mutex that
/// is never held across an await point.
pub struct MemoryBackend {
    samples: DashMap<String, VecDeque<Sample>>,
    next_sample_id: AtomicI64,
    next_row_id: AtomicI64,
    tables: Mutex<Tables>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            samples: DashMap::new(),
            next_sample_id: AtomicI64::new(1),
            next_row_id: AtomicI64::new(1),
            tables: Mutex::new(Tables::default()),
        }
    }

    fn tables(&self) -> StorageResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StorageError::QueryFailed("in-memory tables poisoned".to_string()))
    }

    fn total_samples(&self) -> usize {
        self.samples.iter().map(|shard| shard.len()).sum()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleStore for MemoryBackend {
    async fn append(&self, sample: NewSample) -> StorageResult<SampleId> {
        let id = self.next_sample_id.fetch_add(1, Ordering::SeqCst);
        let subject = sample.subject().to_string();

        let mut shard = self.samples.entry(subject).or_default();
        // Keep each shard ordered by timestamp, then id
        let at = sample.timestamp();
        let position = shard
            .iter()
            .rposition(|existing| existing.timestamp() <= at)
            .map_or(0, |index| index + 1);
        shard.insert(position, Sample { id, data: sample });

        if shard.len() > MAX_SAMPLES_PER_SUBJECT {
            shard.pop_front();
        }

        Ok(id)
    }

    async fn query_latest(
        &self,
        subject: &str,
        metric_type: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<Sample>> {
        let Some(shard) = self.samples.get(subject) else {
            return Ok(None);
        };

        let latest = shard
            .iter()
            .rev()
            .take_while(|sample| sample.timestamp() >= since)
            .find(|sample| sample.provides(metric_type))
            .cloned();

        Ok(latest)
    }

    async fn query_range(
        &self,
        subject: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Sample>> {
        debug!("querying in-memory samples for {subject}");

        let samples = self
            .samples
            .get(subject)
            .map(|shard| {
                shard
                    .iter()
                    .filter(|sample| sample.timestamp() >= from && sample.timestamp() < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(samples)
    }

    async fn cleanup_samples_before(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut deleted = 0;
        for mut shard in self.samples.iter_mut() {
            let len = shard.len();
            shard.retain(|sample| sample.timestamp() >= before);
            deleted += len - shard.len();
        }
        Ok(deleted)
    }

    async fn insert_incident(&self, incident: NewIncident) -> StorageResult<Incident> {
        let mut tables = self.tables()?;

        let duplicate = tables.incidents.iter().any(|existing| {
            existing.is_open()
                && existing.service_name == incident.service_name
                && existing.title == incident.title
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "open incident already exists for {} / {}",
                incident.service_name, incident.title
            )));
        }

        let id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
        let incident = incident.into_incident(id);
        tables.incidents.push(incident.clone());
        Ok(incident)
    }

    async fn find_open_incident(
        &self,
        service_name: &str,
        title: &str,
    ) -> StorageResult<Option<Incident>> {
        let tables = self.tables()?;
        Ok(tables
            .incidents
            .iter()
            .find(|i| i.is_open() && i.service_name == service_name && i.title == title)
            .cloned())
    }

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>> {
        let tables = self.tables()?;
        Ok(tables.incidents.iter().find(|i| i.id == id).cloned())
    }

    async fn update_incident(&self, incident: &Incident) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let Some(existing) = tables.incidents.iter_mut().find(|i| i.id == incident.id) else {
            return Err(StorageError::NotFound(format!("incident {}", incident.id)));
        };

        existing.severity = incident.severity;
        existing.description = incident.description.clone();
        existing.resolved_at = incident.resolved_at;
        existing.acknowledged_by = incident.acknowledged_by.clone();
        existing.last_value = incident.last_value;
        Ok(())
    }

    async fn list_open_incidents(&self) -> StorageResult<Vec<Incident>> {
        let tables = self.tables()?;
        let mut open: Vec<Incident> = tables
            .incidents
            .iter()
            .filter(|i| i.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|i| (i.triggered_at, i.id));
        Ok(open)
    }

    async fn list_thresholds(&self) -> StorageResult<Vec<AlertThreshold>> {
        Ok(self.tables()?.thresholds.clone())
    }

    async fn insert_threshold(&self, threshold: NewThreshold) -> StorageResult<AlertThreshold> {
        let id = self.next_row_id.fetch_add(1, Ordering::SeqCst);
        let threshold = threshold.into_threshold(id, Utc::now());
        self.tables()?.thresholds.push(threshold.clone());
        Ok(threshold)
    }

    async fn insert_daily_aggregate(&self, aggregate: DailyAggregate) -> StorageResult<bool> {
        let mut tables = self.tables()?;
        let key = (aggregate.date, aggregate.service_name.clone());
        if tables.daily.contains_key(&key) {
            return Ok(false);
        }
        tables.daily.insert(key, aggregate);
        Ok(true)
    }

    async fn get_daily_aggregate(
        &self,
        date: NaiveDate,
        service_name: &str,
    ) -> StorageResult<Option<DailyAggregate>> {
        let tables = self.tables()?;
        Ok(tables
            .daily
            .get(&(date, service_name.to_string()))
            .cloned())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_samples".to_string(), self.total_samples().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
