//! Integration tests for the monitoring pipeline

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/fleet_scenarios.rs"]
mod fleet_scenarios;

#[path = "integration/incident_lifecycle.rs"]
mod incident_lifecycle;

#[path = "integration/concurrency.rs"]
mod concurrency;

#[path = "integration/actor_pipeline.rs"]
mod actor_pipeline;

#[cfg(feature = "storage-sqlite")]
#[path = "integration/storage_persistence.rs"]
mod storage_persistence;
