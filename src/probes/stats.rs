//! Storage target probes (databases, buckets, KV namespaces).
//!
//! Each target exposes a JSON stats endpoint. Field names differ a little
//! between target classes, so the response accepts the common aliases.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use super::{Probe, ProbeFailure, ProbeTarget, TargetKind, probe_failure_metric};
use crate::config::{BucketConfig, DatabaseConfig, KvNamespaceConfig};
use crate::storage::{NewSample, StorageStat, StorageTargetKind};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsResponse {
    #[serde(default, alias = "total_size_bytes")]
    pub size_bytes: Option<u64>,

    #[serde(default, alias = "key_count")]
    pub object_count: Option<u64>,

    #[serde(default, alias = "rows_read")]
    pub reads: Option<u64>,

    #[serde(default, alias = "rows_written")]
    pub writes: Option<u64>,
}

pub struct StorageStatsProbe {
    target: ProbeTarget,
    storage_kind: StorageTargetKind,
    client: Client,
}

impl StorageStatsProbe {
    pub fn database(client: Client, config: &DatabaseConfig) -> Self {
        Self::new(
            client,
            &config.name,
            &config.stats_url,
            StorageTargetKind::Database,
        )
    }

    pub fn bucket(client: Client, config: &BucketConfig) -> Self {
        Self::new(
            client,
            &config.name,
            &config.stats_url,
            StorageTargetKind::Bucket,
        )
    }

    pub fn kv_namespace(client: Client, config: &KvNamespaceConfig) -> Self {
        Self::new(
            client,
            &config.name,
            &config.stats_url,
            StorageTargetKind::KvNamespace,
        )
    }

    fn new(client: Client, name: &str, url: &str, storage_kind: StorageTargetKind) -> Self {
        let kind = match storage_kind {
            StorageTargetKind::Database => TargetKind::Database,
            StorageTargetKind::Bucket => TargetKind::Bucket,
            StorageTargetKind::KvNamespace => TargetKind::KvNamespace,
        };

        Self {
            target: ProbeTarget {
                name: name.to_string(),
                kind,
                url: url.to_string(),
            },
            storage_kind,
            client,
        }
    }

    pub fn sample(&self, stats: StatsResponse, at: DateTime<Utc>) -> NewSample {
        NewSample::StorageStat(StorageStat {
            target_name: self.target.name.clone(),
            target_kind: self.storage_kind,
            size_bytes: stats.size_bytes,
            object_count: stats.object_count,
            reads: stats.reads,
            writes: stats.writes,
            recorded_at: at,
        })
    }
}

#[async_trait]
impl Probe for StorageStatsProbe {
    fn target(&self) -> &ProbeTarget {
        &self.target
    }

    #[instrument(skip(self), fields(target = %self.target.name, kind = %self.storage_kind))]
    async fn probe(&self) -> Result<Vec<NewSample>, ProbeFailure> {
        let response = self.client.get(&self.target.url).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(ProbeFailure::HttpStatus {
                status: status.as_u16(),
                response_time_ms: 0,
            });
        }

        let body = response.text().await?;
        let stats: StatsResponse = serde_json::from_str(&body)
            .map_err(|e| ProbeFailure::InvalidResponse(format!("failed to parse stats: {e}")))?;

        Ok(vec![self.sample(stats, Utc::now())])
    }

    fn failure_samples(&self, failure: &ProbeFailure, at: DateTime<Utc>) -> Vec<NewSample> {
        vec![probe_failure_metric(&self.target, failure, at)]
    }
}
