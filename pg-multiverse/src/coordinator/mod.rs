//! Top-level facade.
//!
//! Composes the cluster manager, cache, transaction engine, migration
//! engine, and configuration store behind one query interface.

pub mod error;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use futures::future::BoxFuture;
use pg_multiverse_config::{CacheStrategy, Config, SchemaMapping, Validation};
use pg_multiverse_stats::{CacheStats, ClusterHealth, ClusterStats, TransactionMetrics};
use serde_json::Value;
use tokio::spawn;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::driver::{Driver, QueryResult};
use crate::backend::health::HEALTH_CHECK_INTERVAL;
use crate::backend::pool::pool_impl::PoolInfo;
use crate::backend::{ClusterManager, Guard};
use crate::cache::{CacheBackend, MemoryCache, MemoryCacheConfig, SetOptions};
use crate::config::ConfigStore;
use crate::events::{Event, Events};
use crate::migrate::{MigrationConfig, MigrationManager};
use crate::transaction::{TransactionManager, TransactionOptions, TransactionStatement};
use crate::util;

pub use crate::backend::request::{Operation, QueryOptions};
pub use error::Error;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Serve reads through a cache.
    pub cache_enabled: bool,
    pub cache: MemoryCacheConfig,
    /// TTL for cached query results without an explicit one.
    pub default_cache_ttl: Duration,
    pub health_check_interval: Duration,
    pub migrations: MigrationConfig,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache: MemoryCacheConfig::default(),
            default_cache_ttl: Duration::from_secs(60),
            health_check_interval: HEALTH_CHECK_INTERVAL,
            migrations: MigrationConfig::default(),
        }
    }
}

/// Which cache axis to invalidate. Only the first set criterion is
/// honored, in field order.
#[derive(Debug, Clone, Default)]
pub struct InvalidateCriteria {
    pub schema: Option<String>,
    pub tags: Option<Vec<String>>,
    pub cluster: Option<String>,
    pub pattern: Option<String>,
}

/// Merged system-wide metrics.
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub clusters: FnvHashMap<String, ClusterStats>,
    pub pools: FnvHashMap<String, Vec<PoolInfo>>,
    pub cache: Option<CacheStats>,
    pub transactions: TransactionMetrics,
    pub uptime: Duration,
    pub total_queries: usize,
    pub avg_response_time: Duration,
    /// Failed queries as a percentage of all queries.
    pub error_rate: f64,
}

/// Closure-scoped handle into an open transaction.
pub struct TransactionScope {
    transactions: TransactionManager,
    pub id: Uuid,
}

impl TransactionScope {
    pub async fn execute(
        &self,
        statement: &TransactionStatement,
    ) -> Result<QueryResult, crate::transaction::Error> {
        self.transactions.execute(self.id, statement).await
    }
}

/// The public entry point.
pub struct Coordinator {
    store: ConfigStore,
    manager: ClusterManager,
    cache: Option<Arc<dyn CacheBackend>>,
    memory_cache: Option<MemoryCache>,
    transactions: TransactionManager,
    migrations: MigrationManager,
    events: Events,
    options: CoordinatorOptions,
    started_at: Instant,
    initialized: AtomicBool,
}

impl Coordinator {
    pub fn new(
        driver: Arc<dyn Driver>,
        config_path: Option<PathBuf>,
        options: CoordinatorOptions,
    ) -> Self {
        let events = Events::new();
        let store = ConfigStore::new(config_path, events.clone());
        let manager = ClusterManager::with_health_interval(
            driver,
            events.clone(),
            options.health_check_interval,
        );

        let (cache, memory_cache) = if options.cache_enabled {
            let memory = MemoryCache::new(options.cache.clone(), events.clone());
            (
                Some(Arc::new(memory.clone()) as Arc<dyn CacheBackend>),
                Some(memory),
            )
        } else {
            (None, None)
        };

        let transactions = TransactionManager::new(manager.clone(), events.clone());
        let migrations =
            MigrationManager::new(manager.clone(), options.migrations.clone(), events.clone());

        Self {
            store,
            manager,
            cache,
            memory_cache,
            transactions,
            migrations,
            events,
            options,
            started_at: Instant::now(),
            initialized: AtomicBool::new(false),
        }
    }

    /// Swap the cache backend, e.g. for Redis or a fallback pair.
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self.memory_cache = None;
        self
    }

    /// Validate the configuration, bring up every cluster, start the
    /// config watcher, and go live.
    pub async fn initialize(&self, config: Option<Config>) -> Result<(), Error> {
        let config = match config {
            Some(config) => {
                self.store.replace(config);
                self.store.get()
            }
            None => self.store.load_config()?,
        };

        let validation = config.validate();
        if !validation.valid {
            return Err(Error::ConfigInvalid(validation.errors));
        }

        self.manager.initialize(&config).await?;

        if let Some(memory) = &self.memory_cache {
            memory.launch();
        }

        self.store.watch();
        self.spawn_reload_listener();

        self.initialized.store(true, Ordering::SeqCst);
        info!("coordinator initialized with {} clusters", config.clusters.len());
        self.events.emit(Event::Initialized);

        Ok(())
    }

    /// Re-apply the configuration whenever the watcher reports a change.
    fn spawn_reload_listener(&self) {
        let store = self.store.clone();
        let manager = self.manager.clone();
        let events = self.events.clone();
        let mut rx = self.events.subscribe();

        spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::ConfigChanged) => {
                        match manager.update_config(&store.get()).await {
                            Ok(()) => events.emit(Event::ConfigReloaded),
                            Err(err) => {
                                warn!("config reload failed: {}", err);
                                events.emit(Event::Error {
                                    message: err.to_string(),
                                });
                            }
                        }
                    }
                    Ok(Event::Closed) => break,
                    Ok(_) => (),
                    // Missed events are fine, the store has the latest.
                    Err(broadcast::error::RecvError::Lagged(_)) => (),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Route and run one statement, through the cache when asked.
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult, Error> {
        self.ensure_initialized()?;

        let mut options = options.clone();
        let operation = options
            .operation
            .unwrap_or_else(|| Operation::detect(sql));
        options.operation = Some(operation);

        let cache = match (&self.cache, options.cache && operation == Operation::Read) {
            (Some(cache), true) => Some(cache.clone()),
            _ => None,
        };

        let key = options.cache_key.clone().unwrap_or_else(|| {
            util::cache_key(sql, params, options.schema.as_deref())
        });

        if let Some(cache) = &cache {
            match cache.get(&key).await {
                Ok(Some(value)) => {
                    self.events.emit(Event::CacheHit { key: key.clone() });
                    return Ok(serde_json::from_value(value)?);
                }
                Ok(None) => {
                    self.events.emit(Event::CacheMiss { key: key.clone() });
                }
                Err(err) => {
                    warn!("cache read failed: {}", err);
                }
            }
        }

        let cluster_id = self.manager.resolve_cluster(&options)?.id().to_string();

        let started = Instant::now();
        let result = self.manager.execute_query(sql, params, &options).await;
        let duration = started.elapsed();

        match result {
            Ok(result) => {
                self.events.emit(Event::QueryExecuted {
                    sql: sql.to_string(),
                    params: params.to_vec(),
                    duration,
                    cluster_id: cluster_id.clone(),
                });

                if let Some(cache) = &cache {
                    let mut tags = options.tags.clone();
                    if let Some(schema) = &options.schema {
                        if !tags.contains(schema) {
                            tags.push(schema.clone());
                        }
                    }

                    let set = SetOptions {
                        ttl: Some(
                            options.cache_ttl.unwrap_or(self.options.default_cache_ttl),
                        ),
                        tags,
                        schema: options.schema.clone(),
                        cluster: Some(cluster_id),
                    };
                    if let Err(err) = cache
                        .set(&key, serde_json::to_value(&result)?, &set)
                        .await
                    {
                        warn!("cache write failed: {}", err);
                    }
                }

                Ok(result)
            }
            Err(err) => {
                self.events.emit(Event::QueryError {
                    sql: sql.to_string(),
                    error: err.to_string(),
                    cluster_id,
                });
                Err(err.into())
            }
        }
    }

    /// Check a routed connection out for manual use.
    pub async fn get_connection(&self, options: &QueryOptions) -> Result<Guard, Error> {
        self.ensure_initialized()?;
        Ok(self.manager.get_connection(options).await?)
    }

    pub async fn begin_transaction(
        &self,
        schemas: &[String],
        options: &TransactionOptions,
    ) -> Result<Uuid, Error> {
        self.ensure_initialized()?;
        Ok(self.transactions.begin(schemas, options).await?)
    }

    pub async fn execute_in_transaction(
        &self,
        id: Uuid,
        statement: &TransactionStatement,
    ) -> Result<QueryResult, Error> {
        Ok(self.transactions.execute(id, statement).await?)
    }

    pub async fn commit_transaction(&self, id: Uuid) -> Result<(), Error> {
        Ok(self.transactions.commit(id).await?)
    }

    pub async fn rollback_transaction(&self, id: Uuid) -> Result<(), Error> {
        Ok(self.transactions.rollback(id).await?)
    }

    /// Open a transaction, run the closure, commit on success and roll
    /// back on any error.
    pub async fn with_transaction<T, F>(&self, schemas: &[String], f: F) -> Result<T, Error>
    where
        F: for<'a> FnOnce(&'a TransactionScope) -> BoxFuture<'a, Result<T, Error>>,
    {
        self.ensure_initialized()?;

        let id = self
            .transactions
            .begin(schemas, &TransactionOptions::default())
            .await?;
        let scope = TransactionScope {
            transactions: self.transactions.clone(),
            id,
        };

        match f(&scope).await {
            Ok(value) => {
                self.transactions.commit(id).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.transactions.rollback(id).await {
                    warn!("rollback failed: {} [{}]", rollback_err, id);
                }
                Err(err)
            }
        }
    }

    /// Map a schema to a cluster at runtime.
    pub fn register_schema(
        &self,
        schema: &str,
        cluster_id: &str,
        mapping: Option<SchemaMapping>,
    ) {
        let mapping = mapping.unwrap_or(SchemaMapping {
            cluster_id: cluster_id.to_string(),
            shard_key: None,
            cache_strategy: CacheStrategy::default(),
            priority: 0,
        });

        self.manager.register_schema(schema, mapping);
        self.events.emit(Event::SchemaRegistered {
            schema: schema.to_string(),
            cluster_id: cluster_id.to_string(),
        });
    }

    /// Invalidate cached entries by exactly one criterion.
    pub async fn invalidate_cache(&self, criteria: &InvalidateCriteria) -> Result<usize, Error> {
        let cache = match &self.cache {
            Some(cache) => cache,
            None => return Ok(0),
        };

        if let Some(schema) = &criteria.schema {
            return Ok(cache.invalidate_by_schema(schema).await?);
        }
        if let Some(tags) = &criteria.tags {
            return Ok(cache.invalidate_by_tags(tags).await?);
        }
        if let Some(cluster) = &criteria.cluster {
            return Ok(cache.invalidate_by_cluster(cluster).await?);
        }
        if let Some(pattern) = &criteria.pattern {
            return Ok(cache.invalidate_by_pattern(pattern).await?);
        }

        Ok(0)
    }

    pub fn get_metrics(&self) -> SystemMetrics {
        let clusters = self.manager.get_stats();

        let total_queries: usize = clusters.values().map(|stats| stats.queries).sum();
        let total_errors: usize = clusters.values().map(|stats| stats.errors).sum();
        let with_queries: Vec<&ClusterStats> =
            clusters.values().filter(|stats| stats.queries > 0).collect();
        let avg_response_time = if with_queries.is_empty() {
            Duration::ZERO
        } else {
            with_queries
                .iter()
                .map(|stats| stats.avg_response_time)
                .sum::<Duration>()
                / with_queries.len() as u32
        };
        let error_rate = if total_queries == 0 {
            0.0
        } else {
            total_errors as f64 / total_queries as f64 * 100.0
        };

        SystemMetrics {
            clusters,
            pools: self.manager.get_metrics(),
            cache: self.cache.as_ref().map(|cache| cache.stats()),
            transactions: self.transactions.metrics(),
            uptime: self.started_at.elapsed(),
            total_queries,
            avg_response_time,
            error_rate,
        }
    }

    /// Probe every cluster now.
    pub async fn health_check(&self) -> FnvHashMap<String, ClusterHealth> {
        let mut health = FnvHashMap::default();

        for cluster in self.manager.get_clusters() {
            if let Some(result) = self.manager.force_health_check(&cluster.id).await {
                health.insert(cluster.id, result);
            }
        }

        health
    }

    pub fn validate_config(&self) -> Validation {
        self.store.validate()
    }

    /// Roll back open transactions, stop the watcher and health checks,
    /// drain the pools.
    pub async fn close(&self) {
        self.transactions.close().await;
        self.store.close();
        self.migrations.close();

        if let Some(memory) = &self.memory_cache {
            memory.shutdown();
        }

        self.manager.close().await;
        self.initialized.store(false, Ordering::SeqCst);
        self.events.emit(Event::Closed);
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }

    pub fn migrations(&self) -> &MigrationManager {
        &self.migrations
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    fn ensure_initialized(&self) -> Result<(), Error> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }
}
