//! In-memory cache backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pg_multiverse_stats::CacheStats;
use regex::Regex;
use serde_json::Value;
use tokio::time::sleep;
use tokio::{select, spawn, sync::Notify};
use tracing::debug;

use crate::events::{Event, Events, EvictionReason};

use super::entry::{now_millis, CacheEntry, EntryMetadata};
use super::{CacheBackend, Error, EvictionStrategy, SetOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCacheConfig {
    /// Entry count at which a victim is evicted before inserting.
    pub max_size: usize,
    pub strategy: EvictionStrategy,
    /// TTL applied when a `set` doesn't carry one.
    pub default_ttl: Duration,
    /// How often the expiry sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            strategy: EvictionStrategy::default(),
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct MemoryInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: MemoryCacheConfig,
    stats: Mutex<CacheStats>,
    events: Events,
    shutdown: Notify,
    sweeping: AtomicBool,
}

/// In-memory backend. Cheap to clone.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<MemoryInner>,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig, events: Events) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                entries: Mutex::new(HashMap::new()),
                config,
                stats: Mutex::new(CacheStats::default()),
                events,
                shutdown: Notify::new(),
                sweeping: AtomicBool::new(false),
            }),
        }
    }

    /// Start the expiry sweeper.
    pub fn launch(&self) {
        if self.inner.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }

        let cache = self.clone();
        spawn(async move {
            loop {
                select! {
                    _ = sleep(cache.inner.config.sweep_interval) => (),
                    _ = cache.inner.shutdown.notified() => break,
                }

                if !cache.inner.sweeping.load(Ordering::SeqCst) {
                    break;
                }

                cache.sweep();
            }
        });
    }

    pub fn shutdown(&self) {
        self.inner.sweeping.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    /// Evict everything past its expiry.
    pub(crate) fn sweep(&self) {
        let now = now_millis();
        let expired: Vec<String> = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| entry.expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        if expired.is_empty() {
            return;
        }

        debug!("sweeping {} expired cache entries", expired.len());

        let mut entries = self.inner.entries.lock();
        let mut stats = self.inner.stats.lock();
        for key in expired {
            if entries.remove(&key).is_some() {
                stats.evictions += 1;
                self.inner.events.emit(Event::CacheEviction {
                    key,
                    reason: EvictionReason::Ttl,
                });
            }
        }
    }

    /// Pick a victim per the configured strategy and remove it.
    fn evict_one(&self, entries: &mut HashMap<String, CacheEntry>) {
        let victim = match self.inner.config.strategy {
            EvictionStrategy::Lru => entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed),
            EvictionStrategy::Lfu => entries.iter().min_by_key(|(_, entry)| entry.access_count),
            EvictionStrategy::Fifo => entries.iter().min_by_key(|(_, entry)| entry.created_at),
        }
        .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            entries.remove(&key);
            self.inner.stats.lock().evictions += 1;
            self.inner.events.emit(Event::CacheEviction {
                key,
                reason: EvictionReason::Size,
            });
        }
    }

    fn remove_matching<F>(&self, matches: F) -> usize
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        let mut entries = self.inner.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| matches(key, entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            entries.remove(key);
            self.inner.events.emit(Event::CacheEviction {
                key: key.clone(),
                reason: EvictionReason::Manual,
            });
        }

        keys.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        let now = now_millis();
        let mut entries = self.inner.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if entry.expired(now) => {
                // Expired entries are removed on access.
                entries.remove(key);
                self.inner.stats.lock().misses += 1;
                Ok(None)
            }
            Some(entry) => {
                entry.touch(now);
                self.inner.stats.lock().hits += 1;
                Ok(Some(entry.value.clone()))
            }
            None => {
                self.inner.stats.lock().misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, options: &SetOptions) -> Result<(), Error> {
        let now = now_millis();
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);

        let entry = CacheEntry {
            value,
            absolute_expiry: now + ttl.as_millis() as i64,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size,
            tags: options.tags.clone(),
            schema: options.schema.clone(),
            cluster: options.cluster.clone(),
        };

        let mut entries = self.inner.entries.lock();
        if !entries.contains_key(key) && entries.len() >= self.inner.config.max_size {
            self.evict_one(&mut entries);
        }
        entries.insert(key.to_string(), entry);
        self.inner.stats.lock().sets += 1;

        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, Error> {
        let now = now_millis();
        Ok(self
            .inner
            .entries
            .lock()
            .get(key)
            .map(|entry| !entry.expired(now))
            .unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let removed = self.inner.entries.lock().remove(key).is_some();
        if removed {
            self.inner.stats.lock().deletes += 1;
        }
        Ok(removed)
    }

    async fn invalidate_by_schema(&self, schema: &str) -> Result<usize, Error> {
        Ok(self.remove_matching(|_, entry| entry.schema.as_deref() == Some(schema)))
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<usize, Error> {
        Ok(self.remove_matching(|_, entry| entry.tags.iter().any(|tag| tags.contains(tag))))
    }

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<usize, Error> {
        Ok(self.remove_matching(|_, entry| entry.cluster.as_deref() == Some(cluster)))
    }

    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, Error> {
        let regex = Regex::new(pattern)?;
        Ok(self.remove_matching(|key, _| regex.is_match(key)))
    }

    async fn clear(&self) -> Result<(), Error> {
        self.inner.entries.lock().clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let mut stats = *self.inner.stats.lock();
        let entries = self.inner.entries.lock();
        stats.entries = entries.len();
        stats.size_bytes = entries.values().map(|entry| entry.size).sum();
        stats
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, Error> {
        Ok(self
            .inner
            .entries
            .lock()
            .get(key)
            .map(EntryMetadata::from))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::events;
    use serde_json::json;

    fn cache(max_size: usize, strategy: EvictionStrategy) -> MemoryCache {
        MemoryCache::new(
            MemoryCacheConfig {
                max_size,
                strategy,
                default_ttl: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(60),
            },
            Events::new(),
        )
    }

    async fn set(cache: &MemoryCache, key: &str, options: SetOptions) {
        cache.set(key, json!({"k": key}), &options).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_set_expiry() {
        let cache = cache(10, EvictionStrategy::Lru);

        cache
            .set(
                "short",
                json!(1),
                &SetOptions {
                    ttl: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(cache.get("short").await.unwrap(), Some(json!(1)));
        assert!(cache.has("short").await.unwrap());

        sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert!(!cache.has("short").await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_access_bookkeeping() {
        let cache = cache(10, EvictionStrategy::Lru);
        set(&cache, "a", SetOptions::default()).await;

        cache.get("a").await.unwrap();
        cache.get("a").await.unwrap();

        let meta = cache.metadata("a").await.unwrap().unwrap();
        assert_eq!(meta.access_count, 2);
        assert!(meta.last_accessed >= meta.created_at);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = cache(2, EvictionStrategy::Lru);

        set(&cache, "old", SetOptions::default()).await;
        sleep(Duration::from_millis(5)).await;
        set(&cache, "new", SetOptions::default()).await;
        sleep(Duration::from_millis(5)).await;

        // Touch "old" so "new" becomes the least recently used.
        cache.get("old").await.unwrap();
        sleep(Duration::from_millis(5)).await;

        set(&cache, "third", SetOptions::default()).await;

        assert!(cache.has("old").await.unwrap());
        assert!(!cache.has("new").await.unwrap());
        assert!(cache.has("third").await.unwrap());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_lfu_eviction() {
        let cache = cache(2, EvictionStrategy::Lfu);

        set(&cache, "popular", SetOptions::default()).await;
        set(&cache, "unpopular", SetOptions::default()).await;
        cache.get("popular").await.unwrap();
        cache.get("popular").await.unwrap();
        cache.get("unpopular").await.unwrap();

        set(&cache, "third", SetOptions::default()).await;

        assert!(cache.has("popular").await.unwrap());
        assert!(!cache.has("unpopular").await.unwrap());
    }

    #[tokio::test]
    async fn test_fifo_eviction() {
        let cache = cache(2, EvictionStrategy::Fifo);

        set(&cache, "first", SetOptions::default()).await;
        sleep(Duration::from_millis(5)).await;
        set(&cache, "second", SetOptions::default()).await;
        sleep(Duration::from_millis(5)).await;

        // Access order doesn't matter for FIFO.
        cache.get("first").await.unwrap();
        set(&cache, "third", SetOptions::default()).await;

        assert!(!cache.has("first").await.unwrap());
        assert!(cache.has("second").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_by_schema() {
        let cache = cache(10, EvictionStrategy::Lru);

        set(
            &cache,
            "u1",
            SetOptions {
                schema: Some("users".into()),
                ..Default::default()
            },
        )
        .await;
        set(
            &cache,
            "u2",
            SetOptions {
                schema: Some("users".into()),
                ..Default::default()
            },
        )
        .await;
        set(
            &cache,
            "o1",
            SetOptions {
                schema: Some("orders".into()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(cache.invalidate_by_schema("users").await.unwrap(), 2);
        assert!(!cache.has("u1").await.unwrap());
        assert!(cache.has("o1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_intersection() {
        let cache = cache(10, EvictionStrategy::Lru);

        set(
            &cache,
            "a",
            SetOptions {
                tags: vec!["hot".into(), "users".into()],
                ..Default::default()
            },
        )
        .await;
        set(
            &cache,
            "b",
            SetOptions {
                tags: vec!["cold".into()],
                ..Default::default()
            },
        )
        .await;
        set(&cache, "c", SetOptions::default()).await;

        let removed = cache
            .invalidate_by_tags(&["hot".into(), "archived".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.has("a").await.unwrap());
        assert!(cache.has("b").await.unwrap());
        assert!(cache.has("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidate_by_cluster_and_pattern() {
        let cache = cache(10, EvictionStrategy::Lru);

        set(
            &cache,
            "query:abc",
            SetOptions {
                cluster: Some("main".into()),
                ..Default::default()
            },
        )
        .await;
        set(&cache, "query:def", SetOptions::default()).await;
        set(&cache, "other", SetOptions::default()).await;

        assert_eq!(cache.invalidate_by_cluster("main").await.unwrap(), 1);
        assert_eq!(cache.invalidate_by_pattern("^query:").await.unwrap(), 1);
        assert!(cache.has("other").await.unwrap());

        assert!(cache.invalidate_by_pattern("(").await.is_err());
    }

    #[tokio::test]
    async fn test_sweeper_emits_ttl_evictions() {
        let events = Events::new();
        let cache = MemoryCache::new(
            MemoryCacheConfig {
                max_size: 10,
                strategy: EvictionStrategy::Lru,
                default_ttl: Duration::from_millis(10),
                sweep_interval: Duration::from_secs(60),
            },
            events.clone(),
        );
        let mut rx = events.subscribe();

        cache.set("gone", json!(1), &SetOptions::default()).await.unwrap();
        sleep(Duration::from_millis(30)).await;
        cache.sweep();

        let seen = events::drain(&mut rx);
        assert!(seen.iter().any(|event| matches!(
            event,
            Event::CacheEviction {
                reason: EvictionReason::Ttl,
                ..
            }
        )));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = cache(10, EvictionStrategy::Lru);
        set(&cache, "a", SetOptions::default()).await;
        set(&cache, "b", SetOptions::default()).await;

        cache.clear().await.unwrap();
        assert_eq!(cache.stats().entries, 0);
    }
}
