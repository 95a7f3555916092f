//! SQLite storage backend implementation
//!
//! This module provides a SQLite-based implementation of the `SampleStore` trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Concurrent readers while collectors append
//! - **Connection pooling**: Appends from different collectors do not queue behind one connection
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! ## Layout
//!
//! Every sample kind lands in one `samples` table keyed by an autoincrement id,
//! with the full sample kept as a JSON payload. `subject`, `kind`,
//! `metric_type` and `recorded_at` are broken out for indexing.
//!
//! The "one open incident per (service, title)" rule is a partial unique index,
//! so a racing second insert fails with `StorageError::Conflict`.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, SampleStore};
use super::error::{StorageError, StorageResult};
use super::schema::{
    AlertThreshold, DailyAggregate, Incident, IncidentId, NewIncident, NewSample, NewThreshold,
    Sample, SampleId,
};
use crate::metrics::{self, SourceKind};
use crate::{Operator, Severity};

const INCIDENT_COLUMNS: &str = "id, service_name, metric_type, severity, title, description, \
     triggered_at, resolved_at, acknowledged_by, last_value";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for concurrent appends (WAL mode, busy timeout)
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use grove_monitor::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./monitor.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        info!("SQLite connection pool created");

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            StorageError::SerializationError(format!("timestamp out of range: {millis}"))
        })
    }

    fn sample_from_row(row: &SqliteRow) -> StorageResult<Sample> {
        let payload: String = row.try_get("payload")?;
        let data: NewSample = serde_json::from_str(&payload).map_err(|e| {
            StorageError::SerializationError(format!("failed to deserialize sample: {}", e))
        })?;

        Ok(Sample {
            id: row.try_get("id")?,
            data,
        })
    }

    fn incident_from_row(row: &SqliteRow) -> StorageResult<Incident> {
        let severity: String = row.try_get("severity")?;
        let severity = Severity::from_str(&severity).map_err(StorageError::SerializationError)?;

        Ok(Incident {
            id: row.try_get("id")?,
            service_name: row.try_get("service_name")?,
            metric_type: row.try_get("metric_type")?,
            severity,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            triggered_at: Self::millis_to_timestamp(row.try_get("triggered_at")?)?,
            resolved_at: row
                .try_get::<Option<i64>, _>("resolved_at")?
                .map(Self::millis_to_timestamp)
                .transpose()?,
            acknowledged_by: row.try_get("acknowledged_by")?,
            last_value: row.try_get("last_value")?,
        })
    }

    fn threshold_from_row(row: &SqliteRow) -> StorageResult<AlertThreshold> {
        let operator: String = row.try_get("operator")?;
        let severity: String = row.try_get("severity")?;

        Ok(AlertThreshold {
            id: row.try_get("id")?,
            service_name: row.try_get("service_name")?,
            metric_type: row.try_get("metric_type")?,
            operator: Operator::from_str(&operator).map_err(StorageError::SerializationError)?,
            threshold_value: row.try_get("threshold_value")?,
            severity: Severity::from_str(&severity).map_err(StorageError::SerializationError)?,
            enabled: row.try_get("enabled")?,
            webhook_url: row.try_get("webhook_url")?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?)?,
            updated_at: Self::millis_to_timestamp(row.try_get("updated_at")?)?,
        })
    }

    fn aggregate_from_row(row: &SqliteRow) -> StorageResult<DailyAggregate> {
        let date: String = row.try_get("date")?;
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| StorageError::SerializationError(format!("bad rollup date: {e}")))?;
        let count = |column: &str| -> StorageResult<u64> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
        };

        Ok(DailyAggregate {
            date,
            service_name: row.try_get("service_name")?,
            total_requests: count("total_requests")?,
            total_errors: count("total_errors")?,
            total_d1_reads: count("total_d1_reads")?,
            total_d1_writes: count("total_d1_writes")?,
            total_r2_reads: count("total_r2_reads")?,
            total_r2_writes: count("total_r2_writes")?,
            total_kv_reads: count("total_kv_reads")?,
            total_kv_writes: count("total_kv_writes")?,
            estimated_cost_usd: row.try_get("estimated_cost_usd")?,
        })
    }
}

#[async_trait]
impl SampleStore for SqliteBackend {
    #[instrument(skip(self, sample), fields(subject = %sample.subject()))]
    async fn append(&self, sample: NewSample) -> StorageResult<SampleId> {
        let payload = serde_json::to_string(&sample).map_err(|e| {
            StorageError::SerializationError(format!("failed to serialize sample: {}", e))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO samples (kind, subject, recorded_at, metric_type, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(sample.source_kind().as_str())
        .bind(sample.subject())
        .bind(Self::timestamp_to_millis(&sample.timestamp()))
        .bind(sample.metric_type())
        .bind(payload)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("appended sample {}", id);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn query_latest(
        &self,
        subject: &str,
        metric_type: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Option<Sample>> {
        let kind = metrics::source_kind(metric_type);

        let row = if kind == SourceKind::Metric {
            sqlx::query(
                r#"
                SELECT id, payload FROM samples
                WHERE subject = ? AND kind = ? AND metric_type = ? AND recorded_at >= ?
                ORDER BY recorded_at DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(subject)
            .bind(kind.as_str())
            .bind(metric_type)
            .bind(Self::timestamp_to_millis(&since))
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                SELECT id, payload FROM samples
                WHERE subject = ? AND kind = ? AND recorded_at >= ?
                ORDER BY recorded_at DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(subject)
            .bind(kind.as_str())
            .bind(Self::timestamp_to_millis(&since))
            .fetch_optional(&self.pool)
            .await?
        };

        row.as_ref().map(Self::sample_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn query_range(
        &self,
        subject: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Sample>> {
        debug!("querying samples for {} from {} to {}", subject, from, to);

        let rows = sqlx::query(
            r#"
            SELECT id, payload FROM samples
            WHERE subject = ? AND recorded_at >= ? AND recorded_at < ?
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(subject)
        .bind(Self::timestamp_to_millis(&from))
        .bind(Self::timestamp_to_millis(&to))
        .fetch_all(&self.pool)
        .await?;

        let samples = rows
            .iter()
            .map(Self::sample_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        debug!("query returned {} samples", samples.len());
        Ok(samples)
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_samples_before(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        info!("cleaning up samples older than {}", before);

        let result = sqlx::query("DELETE FROM samples WHERE recorded_at < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old samples", deleted);

        Ok(deleted)
    }

    #[instrument(skip(self, incident), fields(service = %incident.service_name, title = %incident.title))]
    async fn insert_incident(&self, incident: NewIncident) -> StorageResult<Incident> {
        let result = sqlx::query(
            r#"
            INSERT INTO incidents (
                service_name, metric_type, severity, title, description,
                triggered_at, last_value
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&incident.service_name)
        .bind(&incident.metric_type)
        .bind(incident.severity.as_str())
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(Self::timestamp_to_millis(&incident.triggered_at))
        .bind(incident.last_value)
        .execute(&self.pool)
        .await?;

        Ok(incident.into_incident(result.last_insert_rowid()))
    }

    #[instrument(skip(self))]
    async fn find_open_incident(
        &self,
        service_name: &str,
        title: &str,
    ) -> StorageResult<Option<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents \
             WHERE service_name = ? AND title = ? AND resolved_at IS NULL"
        );

        let row = sqlx::query(&sql)
            .bind(service_name)
            .bind(title)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::incident_from_row).transpose()
    }

    async fn get_incident(&self, id: IncidentId) -> StorageResult<Option<Incident>> {
        let sql = format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?");

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::incident_from_row).transpose()
    }

    #[instrument(skip(self, incident), fields(id = incident.id))]
    async fn update_incident(&self, incident: &Incident) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE incidents
            SET severity = ?, description = ?, resolved_at = ?, acknowledged_by = ?, last_value = ?
            WHERE id = ?
            "#,
        )
        .bind(incident.severity.as_str())
        .bind(&incident.description)
        .bind(incident.resolved_at.as_ref().map(Self::timestamp_to_millis))
        .bind(&incident.acknowledged_by)
        .bind(incident.last_value)
        .bind(incident.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("incident {}", incident.id)));
        }
        Ok(())
    }

    async fn list_open_incidents(&self) -> StorageResult<Vec<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents \
             WHERE resolved_at IS NULL ORDER BY triggered_at ASC, id ASC"
        );

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::incident_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_thresholds(&self) -> StorageResult<Vec<AlertThreshold>> {
        let rows = sqlx::query(
            r#"
            SELECT id, service_name, metric_type, operator, threshold_value, severity,
                   enabled, webhook_url, created_at, updated_at
            FROM alert_thresholds
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut thresholds = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::threshold_from_row(row) {
                Ok(threshold) => thresholds.push(threshold),
                Err(e) => warn!("skipping malformed threshold row: {}", e),
            }
        }
        Ok(thresholds)
    }

    async fn insert_threshold(&self, threshold: NewThreshold) -> StorageResult<AlertThreshold> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO alert_thresholds (
                service_name, metric_type, operator, threshold_value, severity,
                enabled, webhook_url, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&threshold.service_name)
        .bind(&threshold.metric_type)
        .bind(threshold.operator.as_str())
        .bind(threshold.threshold_value)
        .bind(threshold.severity.as_str())
        .bind(threshold.enabled)
        .bind(&threshold.webhook_url)
        .bind(Self::timestamp_to_millis(&now))
        .bind(Self::timestamp_to_millis(&now))
        .execute(&self.pool)
        .await?;

        Ok(threshold.into_threshold(result.last_insert_rowid(), now))
    }

    #[instrument(skip(self, aggregate), fields(date = %aggregate.date, service = %aggregate.service_name))]
    async fn insert_daily_aggregate(&self, aggregate: DailyAggregate) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO daily_aggregates (
                date, service_name, total_requests, total_errors,
                total_d1_reads, total_d1_writes, total_r2_reads, total_r2_writes,
                total_kv_reads, total_kv_writes, estimated_cost_usd
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(aggregate.date.format("%Y-%m-%d").to_string())
        .bind(&aggregate.service_name)
        .bind(aggregate.total_requests as i64)
        .bind(aggregate.total_errors as i64)
        .bind(aggregate.total_d1_reads as i64)
        .bind(aggregate.total_d1_writes as i64)
        .bind(aggregate.total_r2_reads as i64)
        .bind(aggregate.total_r2_writes as i64)
        .bind(aggregate.total_kv_reads as i64)
        .bind(aggregate.total_kv_writes as i64)
        .bind(aggregate.estimated_cost_usd)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_daily_aggregate(
        &self,
        date: NaiveDate,
        service_name: &str,
    ) -> StorageResult<Option<DailyAggregate>> {
        let row = sqlx::query(
            r#"
            SELECT date, service_name, total_requests, total_errors,
                   total_d1_reads, total_d1_writes, total_r2_reads, total_r2_writes,
                   total_kv_reads, total_kv_writes, estimated_cost_usd
            FROM daily_aggregates
            WHERE date = ? AND service_name = ?
            "#,
        )
        .bind(date.format("%Y-%m-%d").to_string())
        .bind(service_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::aggregate_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
