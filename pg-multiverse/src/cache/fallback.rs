//! Primary cache with an in-memory safety net.
//!
//! Reads prefer the primary while it is healthy; writes land in both so
//! the fallback can serve when the primary drops out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pg_multiverse_stats::CacheStats;
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{Event, Events};

use super::entry::EntryMetadata;
use super::{CacheBackend, Error, SetOptions};

pub struct FallbackCache {
    primary: Arc<dyn CacheBackend>,
    fallback: Arc<dyn CacheBackend>,
    sync_on_reconnect: bool,
    events: Events,
    primary_was_healthy: AtomicBool,
}

impl FallbackCache {
    pub fn new(
        primary: Arc<dyn CacheBackend>,
        fallback: Arc<dyn CacheBackend>,
        sync_on_reconnect: bool,
        events: Events,
    ) -> Self {
        Self {
            primary,
            fallback,
            sync_on_reconnect,
            events,
            primary_was_healthy: AtomicBool::new(true),
        }
    }

    /// Track primary health transitions; announce recovery.
    fn observe(&self) -> bool {
        let healthy = self.primary.is_healthy();
        let was = self.primary_was_healthy.swap(healthy, Ordering::SeqCst);

        if healthy && !was {
            debug!("primary cache recovered");
            if self.sync_on_reconnect {
                self.events.emit(Event::CacheSync);
            }
        }

        healthy
    }
}

#[async_trait]
impl CacheBackend for FallbackCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        if self.observe() {
            match self.primary.get(key).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!("primary cache read failed: {}", err);
                }
            }
        }

        self.fallback.get(key).await
    }

    async fn set(&self, key: &str, value: Value, options: &SetOptions) -> Result<(), Error> {
        if self.observe() {
            if let Err(err) = self.primary.set(key, value.clone(), options).await {
                warn!("primary cache write failed: {}", err);
            }
        }

        // The fallback always carries a copy.
        self.fallback.set(key, value, options).await
    }

    async fn has(&self, key: &str) -> Result<bool, Error> {
        if self.observe() {
            if let Ok(found) = self.primary.has(key).await {
                return Ok(found);
            }
        }

        self.fallback.has(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let primary = if self.observe() {
            self.primary.delete(key).await.unwrap_or(false)
        } else {
            false
        };
        let fallback = self.fallback.delete(key).await?;

        Ok(primary || fallback)
    }

    async fn invalidate_by_schema(&self, schema: &str) -> Result<usize, Error> {
        let primary = if self.observe() {
            self.primary.invalidate_by_schema(schema).await.unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_schema(schema).await?;

        Ok(primary.max(fallback))
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<usize, Error> {
        let primary = if self.observe() {
            self.primary.invalidate_by_tags(tags).await.unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_tags(tags).await?;

        Ok(primary.max(fallback))
    }

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<usize, Error> {
        let primary = if self.observe() {
            self.primary
                .invalidate_by_cluster(cluster)
                .await
                .unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_cluster(cluster).await?;

        Ok(primary.max(fallback))
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, Error> {
        let primary = if self.observe() {
            self.primary
                .invalidate_by_pattern(pattern)
                .await
                .unwrap_or(0)
        } else {
            0
        };
        let fallback = self.fallback.invalidate_by_pattern(pattern).await?;

        Ok(primary.max(fallback))
    }

    async fn clear(&self) -> Result<(), Error> {
        if self.observe() {
            let _ = self.primary.clear().await;
        }
        self.fallback.clear().await
    }

    fn stats(&self) -> CacheStats {
        if self.primary.is_healthy() {
            self.primary.stats()
        } else {
            self.fallback.stats()
        }
    }

    fn is_healthy(&self) -> bool {
        self.primary.is_healthy() || self.fallback.is_healthy()
    }

    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, Error> {
        if self.observe() {
            if let Ok(meta) = self.primary.metadata(key).await {
                return Ok(meta);
            }
        }

        self.fallback.metadata(key).await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::cache::mock::MockRedis;
    use crate::cache::{MemoryCache, MemoryCacheConfig, RedisCache, RedisCacheConfig};
    use crate::events;
    use serde_json::json;

    fn fallback_cache(redis: &Arc<MockRedis>, events: Events) -> FallbackCache {
        let primary = RedisCache::new(
            redis.clone(),
            RedisCacheConfig {
                retry_delay: Duration::from_millis(5),
                max_retries: 5,
                ..Default::default()
            },
            events.clone(),
        );
        let secondary = MemoryCache::new(MemoryCacheConfig::default(), events.clone());

        FallbackCache::new(Arc::new(primary), Arc::new(secondary), true, events)
    }

    #[tokio::test]
    async fn test_dual_writes_and_failover_reads() {
        let redis = Arc::new(MockRedis::default());
        let events = Events::new();
        let cache = fallback_cache(&redis, events.clone());

        cache.set("k", json!(42), &SetOptions::default()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(42)));

        // Kill the primary; a read now errors on the primary once and
        // comes back from the memory copy.
        redis.set_failing(true);
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(42)));
        assert!(cache.is_healthy());
    }

    #[tokio::test]
    async fn test_sync_event_on_recovery() {
        let redis = Arc::new(MockRedis::default());
        let events = Events::new();
        let cache = fallback_cache(&redis, events.clone());
        let mut rx = events.subscribe();

        redis.set_failing(true);
        let _ = cache.get("missing").await;
        assert!(!cache.primary.is_healthy());

        // Primary comes back; reconnection flips health, next call
        // observes the transition.
        redis.set_failing(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = cache.get("missing").await;

        let seen = events::drain(&mut rx);
        assert!(seen.iter().any(|event| event.kind() == "cacheSync"));
    }

    #[tokio::test]
    async fn test_invalidations_fan_out() {
        let redis = Arc::new(MockRedis::default());
        let events = Events::new();
        let cache = fallback_cache(&redis, events);

        let options = SetOptions {
            schema: Some("users".into()),
            ..Default::default()
        };
        cache.set("a", json!(1), &options).await.unwrap();
        cache.set("b", json!(2), &options).await.unwrap();

        assert_eq!(cache.invalidate_by_schema("users").await.unwrap(), 2);
        assert_eq!(cache.get("a").await.unwrap(), None);

        // Both sides are empty.
        assert_eq!(cache.fallback.get("a").await.unwrap(), None);
    }
}
