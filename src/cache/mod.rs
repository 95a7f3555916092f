//! Status cache: a TTL-bounded projection of fleet state
//!
//! Nothing in the cache is authoritative. The aggregator rewrites every key
//! wholesale each cycle and the incident manager rewrites the active incident
//! set on every transition, so a failed write only lasts until the next one.
//! Readers accept staleness bounded by each key's TTL.

pub mod entries;
pub mod keys;
pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use entries::{ActiveIncident, ActiveIncidents, LatestMetrics, ServiceStatusEntry, SystemOverview};
pub use keys::CacheKey;
pub use memory::MemoryCache;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug)]
pub enum CacheError {
    /// Value could not be (de)serialized
    Serialization(String),

    /// Backend refused or failed the operation
    Backend(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Serialization(msg) => write!(f, "cache value serialization failed: {}", msg),
            CacheError::Backend(msg) => write!(f, "cache backend error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Key/value store with per-entry expiry
#[async_trait]
pub trait StatusCache: Send + Sync {
    /// Replace the value under `key`; `ttl = None` never expires
    async fn put(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    /// Current value, `None` if absent or expired
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<serde_json::Value>>;

    async fn delete(&self, key: &CacheKey) -> CacheResult<()>;
}

/// Serialize `value` and store it with the key family's TTL
pub async fn put_entry<T>(cache: &dyn StatusCache, key: &CacheKey, value: &T) -> CacheResult<()>
where
    T: Serialize + Sync,
{
    let value = serde_json::to_value(value)?;
    cache.put(key, value, key.ttl()).await
}

/// Read and decode the value under `key`
pub async fn get_entry<T>(cache: &dyn StatusCache, key: &CacheKey) -> CacheResult<Option<T>>
where
    T: DeserializeOwned,
{
    match cache.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}
