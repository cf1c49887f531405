//! Redis cache backend.
//!
//! The Redis client is an external collaborator behind [`RedisCommands`].
//! Keys are prefixed; values are JSON, gzip-compressed past a threshold
//! and tagged so reads can detect compression. Index sets per schema,
//! cluster, and tag support the invalidation axes without key scans.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use pg_multiverse_stats::CacheStats;
use serde_json::Value;
use tokio::spawn;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::driver::DriverError;
use crate::events::{Event, Events, EvictionReason};

use super::entry::{now_millis, EntryMetadata};
use super::{CacheBackend, Error, SetOptions};

/// Marker prepended to compressed values.
const GZIP_TAG: &[u8] = b"gzip:";

/// Redis commands the backend relies on. Batched deletes stand in for
/// the driver's pipeline.
#[async_trait]
pub trait RedisCommands: Send + Sync {
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> Result<(), DriverError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DriverError>;
    async fn del(&self, keys: &[String]) -> Result<usize, DriverError>;
    async fn exists(&self, key: &str) -> Result<bool, DriverError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, DriverError>;
    async fn sadd(&self, key: &str, members: &[String]) -> Result<(), DriverError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), DriverError>;
    async fn ping(&self) -> Result<(), DriverError>;
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, DriverError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedisCacheConfig {
    pub key_prefix: String,
    pub default_ttl: Duration,
    /// Values larger than this are gzip-compressed.
    pub compression_threshold: usize,
    /// Reconnection attempts after a lost connection.
    pub max_retries: usize,
    /// Backoff unit; attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "pg-multiverse:".into(),
            default_ttl: Duration::from_secs(60),
            compression_threshold: 1024,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

struct RedisInner {
    commands: Arc<dyn RedisCommands>,
    config: RedisCacheConfig,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    stats: Mutex<CacheStats>,
    events: Events,
}

/// Redis backend. Cheap to clone.
#[derive(Clone)]
pub struct RedisCache {
    inner: Arc<RedisInner>,
}

impl RedisCache {
    pub fn new(commands: Arc<dyn RedisCommands>, config: RedisCacheConfig, events: Events) -> Self {
        Self {
            inner: Arc::new(RedisInner {
                commands,
                config,
                connected: AtomicBool::new(true),
                reconnecting: AtomicBool::new(false),
                stats: Mutex::new(CacheStats::default()),
                events,
            }),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.key_prefix, key)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}:meta", self.key(key))
    }

    fn index_key(&self, axis: &str, value: &str) -> String {
        format!("{}{}:{}", self.inner.config.key_prefix, axis, value)
    }

    /// Record a driver failure and start reconnecting.
    fn mark_disconnected(&self, err: &DriverError) {
        warn!("redis connection lost: {}", err);
        self.inner.connected.store(false, Ordering::SeqCst);

        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let cache = self.clone();
        spawn(async move {
            for attempt in 1..=cache.inner.config.max_retries {
                sleep(cache.inner.config.retry_delay * attempt as u32).await;

                if cache.inner.commands.ping().await.is_ok() {
                    debug!("redis reconnected after {} attempts", attempt);
                    cache.inner.connected.store(true, Ordering::SeqCst);
                    break;
                }
            }
            cache.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    fn check<T>(&self, result: Result<T, DriverError>) -> Result<T, Error> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.mark_disconnected(&err);
                Err(err.into())
            }
        }
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let json = serde_json::to_vec(value)?;

        if json.len() <= self.inner.config.compression_threshold {
            return Ok(json);
        }

        let mut encoder = GzEncoder::new(Vec::from(GZIP_TAG), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn decode(&self, payload: &[u8]) -> Result<Value, Error> {
        if let Some(compressed) = payload.strip_prefix(GZIP_TAG) {
            let mut decoder = GzDecoder::new(compressed);
            let mut json = vec![];
            decoder.read_to_end(&mut json)?;
            return Ok(serde_json::from_slice(&json)?);
        }

        Ok(serde_json::from_slice(payload)?)
    }

    /// Best-effort access bookkeeping in the sibling meta key.
    async fn touch_meta(&self, key: &str) {
        let meta_key = self.meta_key(key);
        let current = match self.inner.commands.get(&meta_key).await {
            Ok(Some(bytes)) => bytes,
            _ => return,
        };

        let mut meta: EntryMetadata = match serde_json::from_slice(&current) {
            Ok(meta) => meta,
            Err(_) => return,
        };

        meta.access_count += 1;
        meta.last_accessed = now_millis();

        if let Ok(bytes) = serde_json::to_vec(&meta) {
            let _ = self.inner.commands.set(&meta_key, &bytes, None).await;
        }
    }

    /// Expand an index set and delete its members and the set itself.
    async fn invalidate_set(&self, index_key: &str) -> Result<usize, Error> {
        let members = self.check(self.inner.commands.smembers(index_key).await)?;

        let mut keys = members.clone();
        for member in &members {
            keys.push(format!("{}:meta", member));
        }
        keys.push(index_key.to_string());

        if members.is_empty() {
            let _ = self.inner.commands.del(&keys).await;
            return Ok(0);
        }

        self.check(self.inner.commands.del(&keys).await)?;
        let deleted = members.len();
        self.inner.stats.lock().deletes += deleted;
        self.emit_evictions(&members);

        Ok(deleted)
    }

    fn emit_evictions(&self, keys: &[String]) {
        let prefix = &self.inner.config.key_prefix;
        for key in keys {
            self.inner.events.emit(Event::CacheEviction {
                key: key.strip_prefix(prefix.as_str()).unwrap_or(key).to_string(),
                reason: EvictionReason::Manual,
            });
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        let payload = self.check(self.inner.commands.get(&self.key(key)).await)?;

        match payload {
            Some(payload) => {
                let value = self.decode(&payload)?;
                self.touch_meta(key).await;
                self.inner.stats.lock().hits += 1;
                Ok(Some(value))
            }
            None => {
                self.inner.stats.lock().misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value, options: &SetOptions) -> Result<(), Error> {
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let payload = self.encode(&value)?;
        let full_key = self.key(key);

        self.check(
            self.inner
                .commands
                .set(&full_key, &payload, Some(ttl))
                .await,
        )?;

        // Index sets back the invalidation axes; their TTL follows the
        // newest member.
        let mut indexes = vec![];
        if let Some(schema) = &options.schema {
            indexes.push(self.index_key("schema", schema));
        }
        if let Some(cluster) = &options.cluster {
            indexes.push(self.index_key("cluster", cluster));
        }
        for tag in &options.tags {
            indexes.push(self.index_key("tag", tag));
        }

        for index in indexes {
            self.check(
                self.inner
                    .commands
                    .sadd(&index, &[full_key.clone()])
                    .await,
            )?;
            let _ = self.inner.commands.expire(&index, ttl).await;
        }

        let now = now_millis();
        let meta = EntryMetadata {
            absolute_expiry: now + ttl.as_millis() as i64,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size: payload.len(),
            tags: options.tags.clone(),
            schema: options.schema.clone(),
            cluster: options.cluster.clone(),
        };
        if let Ok(bytes) = serde_json::to_vec(&meta) {
            let _ = self
                .inner
                .commands
                .set(&self.meta_key(key), &bytes, Some(ttl))
                .await;
        }

        self.inner.stats.lock().sets += 1;

        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, Error> {
        self.check(self.inner.commands.exists(&self.key(key)).await)
    }

    async fn delete(&self, key: &str) -> Result<bool, Error> {
        let deleted = self.check(
            self.inner
                .commands
                .del(&[self.key(key), self.meta_key(key)])
                .await,
        )?;

        if deleted > 0 {
            self.inner.stats.lock().deletes += 1;
        }

        Ok(deleted > 0)
    }

    async fn invalidate_by_schema(&self, schema: &str) -> Result<usize, Error> {
        self.invalidate_set(&self.index_key("schema", schema)).await
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<usize, Error> {
        let mut members: HashSet<String> = HashSet::new();
        let mut sets = vec![];

        for tag in tags {
            let index = self.index_key("tag", tag);
            members.extend(self.check(self.inner.commands.smembers(&index).await)?);
            sets.push(index);
        }

        if members.is_empty() {
            let _ = self.inner.commands.del(&sets).await;
            return Ok(0);
        }

        let mut keys: Vec<String> = members.iter().cloned().collect();
        keys.extend(members.iter().map(|m| format!("{}:meta", m)));
        keys.extend(sets);

        self.check(self.inner.commands.del(&keys).await)?;
        let deleted = members.len();
        self.inner.stats.lock().deletes += deleted;
        let members: Vec<String> = members.into_iter().collect();
        self.emit_evictions(&members);

        Ok(deleted)
    }

    async fn invalidate_by_cluster(&self, cluster: &str) -> Result<usize, Error> {
        self.invalidate_set(&self.index_key("cluster", cluster))
            .await
    }

    /// Best-effort: the pattern is passed to the driver's SCAN as a glob.
    async fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, Error> {
        let scan_pattern = format!("{}{}", self.inner.config.key_prefix, pattern);
        let keys = self.check(self.inner.commands.scan(&scan_pattern).await)?;

        let keys: Vec<String> = keys
            .into_iter()
            .filter(|key| !key.ends_with(":meta"))
            .collect();

        if keys.is_empty() {
            return Ok(0);
        }

        let mut all = keys.clone();
        all.extend(keys.iter().map(|k| format!("{}:meta", k)));

        self.check(self.inner.commands.del(&all).await)?;
        let deleted = keys.len();
        self.inner.stats.lock().deletes += deleted;
        self.emit_evictions(&keys);

        Ok(deleted)
    }

    async fn clear(&self) -> Result<(), Error> {
        let pattern = format!("{}*", self.inner.config.key_prefix);
        let keys = self.check(self.inner.commands.scan(&pattern).await)?;

        if !keys.is_empty() {
            self.check(self.inner.commands.del(&keys).await)?;
        }

        Ok(())
    }

    fn stats(&self) -> CacheStats {
        *self.inner.stats.lock()
    }

    fn is_healthy(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn metadata(&self, key: &str) -> Result<Option<EntryMetadata>, Error> {
        let bytes = self.check(self.inner.commands.get(&self.meta_key(key)).await)?;

        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::mock::MockRedis;
    use serde_json::json;

    fn cache(redis: &Arc<MockRedis>) -> RedisCache {
        RedisCache::new(
            redis.clone(),
            RedisCacheConfig {
                retry_delay: Duration::from_millis(10),
                ..Default::default()
            },
            Events::new(),
        )
    }

    #[tokio::test]
    async fn test_prefix_and_round_trip() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        cache
            .set("k", json!({"rows": [1, 2]}), &SetOptions::default())
            .await
            .unwrap();

        assert!(redis.contains("pg-multiverse:k"));
        assert_eq!(
            cache.get("k").await.unwrap(),
            Some(json!({"rows": [1, 2]}))
        );
        assert!(cache.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_compression_over_threshold() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        let large = json!({"text": "x".repeat(4096)});
        cache.set("big", large.clone(), &SetOptions::default()).await.unwrap();

        let raw = redis.raw("pg-multiverse:big").unwrap();
        assert!(raw.starts_with(GZIP_TAG));
        assert!(raw.len() < 4096);

        assert_eq!(cache.get("big").await.unwrap(), Some(large));
    }

    #[tokio::test]
    async fn test_invalidate_by_schema_expands_set() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        let options = SetOptions {
            schema: Some("users".into()),
            ..Default::default()
        };
        cache.set("a", json!(1), &options).await.unwrap();
        cache.set("b", json!(2), &options).await.unwrap();
        cache.set("c", json!(3), &SetOptions::default()).await.unwrap();

        assert_eq!(cache.invalidate_by_schema("users").await.unwrap(), 2);
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.get("c").await.unwrap(), Some(json!(3)));
        assert!(!redis.contains("pg-multiverse:schema:users"));
    }

    #[tokio::test]
    async fn test_invalidate_by_tags_union() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        cache
            .set(
                "a",
                json!(1),
                &SetOptions {
                    tags: vec!["hot".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        cache
            .set(
                "b",
                json!(2),
                &SetOptions {
                    tags: vec!["hot".into(), "cold".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            cache
                .invalidate_by_tags(&["hot".into(), "cold".into()])
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_pattern_scan() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        cache.set("query:1", json!(1), &SetOptions::default()).await.unwrap();
        cache.set("query:2", json!(2), &SetOptions::default()).await.unwrap();
        cache.set("other", json!(3), &SetOptions::default()).await.unwrap();

        assert_eq!(cache.invalidate_by_pattern("query:*").await.unwrap(), 2);
        assert_eq!(cache.get("other").await.unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_meta_access_count() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        cache.set("k", json!(1), &SetOptions::default()).await.unwrap();
        cache.get("k").await.unwrap();
        cache.get("k").await.unwrap();

        let meta = cache.metadata("k").await.unwrap().unwrap();
        assert_eq!(meta.access_count, 2);
    }

    #[tokio::test]
    async fn test_connection_loss_marks_unhealthy() {
        let redis = Arc::new(MockRedis::default());
        let cache = cache(&redis);

        redis.set_failing(true);
        assert!(cache.get("k").await.is_err());
        assert!(!cache.is_healthy());

        // Reconnect succeeds once the server is back.
        redis.set_failing(false);
        sleep(Duration::from_millis(50)).await;
        assert!(cache.is_healthy());
    }
}
