//! Sample store trait definition
//!
//! This module defines the core `SampleStore` trait that all storage
//! implementations must implement, plus the timeout wrapper every caller in
//! the monitoring core goes through.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::error::{StorageError, StorageResult};
use super::schema::{
    AlertThreshold, DailyAggregate, Incident, IncidentId, NewIncident, NewSample, NewThreshold,
    Sample, SampleId,
};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Durable store for samples, incidents, thresholds and daily aggregates
///
/// The store is the source of truth of the monitoring core: everything in the
/// status cache can be rebuilt from it.
///
/// ## Concurrency
///
/// Implementations must accept concurrent `append` calls from every collector
/// without a global write lock; samples are independent rows.
///
/// ## Error Handling
///
/// Methods return `StorageResult<T>` which wraps `StorageError`.
/// Implementations should convert backend-specific errors to
/// `StorageError` variants.
#[async_trait]
pub trait SampleStore: Send + Sync {
    // ========================================================================
    // Samples
    // ========================================================================

    /// Append a sample and return its id
    ///
    /// Ids are monotonic across all sample kinds.
    async fn append(&self, sample: NewSample) -> StorageResult<SampleId>;

    /// Most recent sample for `subject` that carries `metric_type`,
    /// recorded at or after `since`
    async fn query_latest(
        &self,
        subject: &str,
        metric_type: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<Sample>>;

    /// All samples for `subject` in `[from, to)`, oldest first
    async fn query_range(
        &self,
        subject: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Sample>>;

    /// Delete samples recorded before `before`
    ///
    /// Used for retention policy enforcement. Returns the number deleted.
    async fn cleanup_samples_before(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Incidents
    // ========================================================================

    /// Persist a new open incident
    ///
    /// Fails with `StorageError::Conflict` when an open incident already
    /// exists for the same (service, title).
    async fn insert_incident(&self, incident: NewIncident) -> StorageResult<Incident>;

    /// Open incident for (service, title), if any
    async fn find_open_incident(
        &self,
        service_name: &str,
        title: &str,
    ) -> StorageResult<Option<Incident>>;

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>>;

    /// Overwrite the mutable fields of an incident
    /// (severity, description, resolved_at, acknowledged_by, last_value)
    async fn update_incident(&self, incident: &Incident) -> StorageResult<()>;

    /// All incidents without `resolved_at`, oldest first
    async fn list_open_incidents(&self) -> StorageResult<Vec<Incident>>;

    // ========================================================================
    // Thresholds
    // ========================================================================

    /// All threshold rows (enabled or not)
    ///
    /// Rows that cannot be decoded are skipped with a warning.
    async fn list_thresholds(&self) -> StorageResult<Vec<AlertThreshold>>;

    async fn insert_threshold(&self, threshold: NewThreshold) -> StorageResult<AlertThreshold>;

    // ========================================================================
    // Daily aggregates
    // ========================================================================

    /// Insert a rollup unless one already exists for (date, service)
    ///
    /// Returns whether the row was written. Existing rows are never touched.
    async fn insert_daily_aggregate(&self, aggregate: DailyAggregate) -> StorageResult<bool>;

    async fn get_daily_aggregate(
        &self,
        date: NaiveDate,
        service_name: &str,
    ) -> StorageResult<Option<DailyAggregate>>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend
    /// is operational (e.g., ping database, check file access).
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}

/// Run a store operation with a time budget
///
/// A timed-out operation surfaces as `StorageError::Timeout` instead of
/// hanging its caller.
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(limit)),
    }
}
