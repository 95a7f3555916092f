//! Sample store: durable samples, incidents, thresholds and daily rollups
//!
//! ## Design
//!
//! - **Trait-based**: `SampleStore` trait allows swapping implementations
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Append-only samples**: Collectors append concurrently, nothing updates a sample
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database behind the `storage-sqlite` feature
//! - **In-Memory**: No persistence, for testing or status-only deployments
//!
//! ## Usage
//!
//! ```no_run
//! use grove_monitor::storage::{SampleStore, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./monitor.db").await?;
//!     let open = backend.list_open_incidents().await?;
//!     println!("{} open incidents", open.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, SampleStore, with_timeout};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::{
    AlertThreshold, DailyAggregate, HealthCheck, Incident, IncidentId, IncidentState, Metric,
    NewIncident, NewSample, NewThreshold, Observation, Sample, SampleId, StorageStat,
    StorageTargetKind,
};
