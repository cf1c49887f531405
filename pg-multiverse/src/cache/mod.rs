//! Query result caching.
//!
//! Three backends share one contract: in-memory, Redis, and a fallback
//! wrapper that pairs a primary backend with an in-memory secondary.

pub mod entry;
pub mod error;
pub mod fallback;
pub mod memory;
pub mod redis;

#[cfg(test)]
pub(crate) mod mock;

use std::time::Duration;

use async_trait::async_trait;
use pg_multiverse_stats::CacheStats;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use entry::{CacheEntry, EntryMetadata};
pub use error::Error;
pub use fallback::FallbackCache;
pub use memory::{MemoryCache, MemoryCacheConfig};
pub use redis::{RedisCache, RedisCacheConfig, RedisCommands};

/// How the memory backend picks a victim when full.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Smallest `last_accessed`.
    #[default]
    Lru,
    /// Smallest `access_count`.
    Lfu,
    /// Smallest `created_at`.
    Fifo,
}

/// Options attached to a `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub schema: Option<String>,
    pub cluster: Option<String>,
}

/// Keyed store with TTL, tag, schema, and cluster axes.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, Error>;
    async fn set(&self, key: &str, value: Value, options: &SetOptions) -> Result<(), Error>;
    async fn has(&self, key: &str) -> Result<bool, Error>;
    async fn delete(&self, key: &str) -> Result<bool, Error>;

    async fn invalidate_by_schema(&self, schema: &str) -> Result<usize, Error>;
    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<usize, Error>;
    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<usize, Error>;
    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, Error>;

    async fn clear(&self) -> Result<(), Error>;
    fn stats(&self) -> CacheStats;
    fn is_healthy(&self) -> bool;
    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, Error>;
}
