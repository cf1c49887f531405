//! Cluster registry, schema routing, and failover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use futures::future::{join_all, BoxFuture};
use indexmap::IndexMap;
use parking_lot::RwLock;
use pg_multiverse_config::{
    ClusterConfig, Config, ConsistencyLevel, ReadPreference, SchemaMapping,
};
use pg_multiverse_stats::{ClusterHealth, ClusterStats};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::backend::driver::{Driver, DriverError, QueryResult};
use crate::events::{Event, Events};

use super::cluster::{Cluster, ClusterStatus};
use super::health::{HealthChecker, HEALTH_CHECK_INTERVAL};
use super::pool::{self, Guard, Pool, PoolId, PoolInfo};
use super::request::{Operation, QueryOptions};

/// How long a replica pool gets to become ready during registration
/// before the cluster continues without it.
const REPLICA_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared cluster registry. Insertion order is configuration order.
pub(crate) type Registry = Arc<RwLock<IndexMap<String, Cluster>>>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster manager not initialized")]
    NotInitialized,

    #[error("configuration invalid: {0:?}")]
    ConfigInvalid(Vec<String>),

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("no active cluster")]
    NoActiveCluster,

    #[error("cluster \"{0}\" is {1}")]
    ClusterNotActive(String, ClusterStatus),

    #[error("no replica at index {1} [{0}]")]
    NoSuchReplica(String, usize),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Pool(#[from] pool::Error),

    #[error("{0}")]
    Driver(#[from] DriverError),
}

/// Summary of one registered cluster.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub id: String,
    pub status: ClusterStatus,
    pub schemas: Vec<String>,
    pub replicas: usize,
}

struct ManagerInner {
    driver: Arc<dyn Driver>,
    events: Events,
    clusters: Registry,
    schema_map: RwLock<FnvHashMap<String, SchemaMapping>>,
    health: HealthChecker,
    initialized: AtomicBool,
}

/// Owns every pool and the health checker; routes queries to clusters.
/// Cheap to clone.
#[derive(Clone)]
pub struct ClusterManager {
    inner: Arc<ManagerInner>,
}

impl ClusterManager {
    pub fn new(driver: Arc<dyn Driver>, events: Events) -> Self {
        Self::with_health_interval(driver, events, HEALTH_CHECK_INTERVAL)
    }

    pub fn with_health_interval(
        driver: Arc<dyn Driver>,
        events: Events,
        health_interval: Duration,
    ) -> Self {
        let clusters: Registry = Arc::new(RwLock::new(IndexMap::new()));
        let health = HealthChecker::new(clusters.clone(), events.clone(), health_interval);

        Self {
            inner: Arc::new(ManagerInner {
                driver,
                events,
                clusters,
                schema_map: RwLock::new(FnvHashMap::default()),
                health,
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Register every cluster in the document and start health checks.
    pub async fn initialize(&self, config: &Config) -> Result<(), Error> {
        let validation = config.validate();
        if !validation.valid {
            return Err(Error::ConfigInvalid(validation.errors));
        }

        for (id, cluster) in &config.clusters {
            self.register_cluster(id, cluster.clone()).await?;
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.health.start();

        Ok(())
    }

    /// Apply a new configuration document: close removed clusters,
    /// register new ones, recreate changed ones.
    pub async fn update_config(&self, config: &Config) -> Result<(), Error> {
        let validation = config.validate();
        if !validation.valid {
            return Err(Error::ConfigInvalid(validation.errors));
        }

        let existing: Vec<String> = self.inner.clusters.read().keys().cloned().collect();

        for id in &existing {
            match config.clusters.get(id) {
                None => self.deregister_cluster(id).await,
                Some(new_config) => {
                    let changed = self
                        .cluster(id)
                        .map(|cluster| cluster.config() != new_config)
                        .unwrap_or(true);
                    if changed {
                        self.deregister_cluster(id).await;
                        self.register_cluster(id, new_config.clone()).await?;
                    }
                }
            }
        }

        for (id, cluster_config) in &config.clusters {
            if !existing.contains(id) {
                self.register_cluster(id, cluster_config.clone()).await?;
            }
        }

        Ok(())
    }

    async fn register_cluster(&self, id: &str, config: ClusterConfig) -> Result<(), Error> {
        let options = config.pool_options();

        // The primary must come up; registration fails with it.
        let primary = Pool::new(
            PoolId::primary(id),
            pool::Config::new(config.primary.clone(), options),
            self.inner.driver.clone(),
            self.inner.events.clone(),
        );
        primary.launch();
        primary
            .wait_ready_or_close(primary.config().acquire_timeout())
            .await?;

        // Replicas are best-effort: any that fail to come up in time are
        // dropped and the cluster runs degraded.
        let candidates: Vec<Pool> = config
            .replicas
            .iter()
            .enumerate()
            .map(|(index, replica)| {
                let pool = Pool::new(
                    PoolId::replica(id, index),
                    pool::Config::new(replica.clone(), options),
                    self.inner.driver.clone(),
                    self.inner.events.clone(),
                );
                pool.launch();
                pool
            })
            .collect();

        let readiness = join_all(
            candidates
                .iter()
                .map(|pool| pool.wait_ready_or_close(REPLICA_READY_TIMEOUT)),
        )
        .await;

        let mut replicas = vec![];
        for (pool, ready) in candidates.into_iter().zip(readiness) {
            match ready {
                Ok(()) => replicas.push(pool),
                Err(err) => {
                    warn!("dropping replica: {} [{}]", err, pool.id());
                }
            }
        }

        {
            let mut schema_map = self.inner.schema_map.write();
            for schema in &config.schemas {
                schema_map.insert(
                    schema.clone(),
                    SchemaMapping {
                        cluster_id: id.to_string(),
                        shard_key: config.shard_key.clone(),
                        cache_strategy: config.cache_strategy.unwrap_or_default(),
                        priority: config.priority.unwrap_or(0),
                    },
                );
            }
        }

        let cluster = Cluster::new(id, config, primary, replicas);
        cluster.set_status(ClusterStatus::Active);
        self.inner.clusters.write().insert(id.to_string(), cluster);

        info!("cluster registered [{}]", id);
        self.inner.events.emit(Event::ClusterRegistered {
            cluster_id: id.to_string(),
        });

        Ok(())
    }

    async fn deregister_cluster(&self, id: &str) {
        let cluster = self.inner.clusters.write().shift_remove(id);

        if let Some(cluster) = cluster {
            cluster.close().await;
            self.inner
                .schema_map
                .write()
                .retain(|_, mapping| mapping.cluster_id != id);
            self.inner.health.remove_cluster(id);
        }
    }

    /// Map one schema to a cluster outside of a config reload.
    pub fn register_schema(&self, schema: &str, mapping: SchemaMapping) {
        self.inner
            .schema_map
            .write()
            .insert(schema.to_string(), mapping);
    }

    /// Every mapped schema, sorted.
    pub fn schemas(&self) -> Vec<String> {
        let mut schemas: Vec<String> = self.inner.schema_map.read().keys().cloned().collect();
        schemas.sort();
        schemas
    }

    /// The cluster id a schema routes to.
    pub fn schema_cluster(&self, schema: &str) -> Option<String> {
        self.inner
            .schema_map
            .read()
            .get(schema)
            .map(|mapping| mapping.cluster_id.clone())
    }

    pub(crate) fn resolve_cluster(&self, options: &QueryOptions) -> Result<Cluster, Error> {
        // Explicitly targeted clusters may be routed to in any status.
        if let Some(id) = &options.cluster_id {
            return self
                .cluster(id)
                .ok_or_else(|| Error::UnknownCluster(id.clone()));
        }

        let cluster = if let Some(schema) = &options.schema {
            let id = self
                .schema_cluster(schema)
                .ok_or_else(|| Error::UnknownSchema(schema.clone()))?;
            self.cluster(&id).ok_or(Error::UnknownCluster(id))?
        } else {
            self.inner
                .clusters
                .read()
                .values()
                .find(|cluster| cluster.is_active())
                .cloned()
                .ok_or(Error::NoActiveCluster)?
        };

        if !cluster.is_active() {
            return Err(Error::ClusterNotActive(
                cluster.id().to_string(),
                cluster.status(),
            ));
        }

        Ok(cluster)
    }

    /// Route the request to a pool and check a connection out of it.
    pub async fn get_connection(&self, options: &QueryOptions) -> Result<Guard, Error> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        let cluster = self.resolve_cluster(options)?;

        let operation = options.resolved_operation();
        let consistency = options
            .consistency
            .unwrap_or(cluster.config().consistency_level);
        let use_replica = operation != Operation::Write
            && consistency != ConsistencyLevel::Strong
            && cluster.config().read_preference != ReadPreference::Primary;

        let pool = if use_replica {
            cluster.select_replica().unwrap_or_else(|| cluster.primary())
        } else {
            cluster.primary()
        };

        let mut conn = pool.acquire().await?;
        conn.set_schema(options.schema.clone());
        conn.track(cluster.connections_gauge());

        Ok(conn)
    }

    /// Route, execute, account, release. The operation is sniffed from
    /// the statement unless the caller pinned one.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<QueryResult, Error> {
        let mut options = options.clone();
        options.operation = Some(
            options
                .operation
                .unwrap_or_else(|| Operation::detect(sql)),
        );

        let mut conn = self.get_connection(&options).await?;
        let cluster_id = conn.metadata().cluster_id.clone();

        let started = Instant::now();
        let result = match options.timeout {
            Some(deadline) => match timeout(deadline, conn.execute(sql, params)).await {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::Timeout(deadline)),
            },
            None => conn.execute(sql, params).await.map_err(Error::from),
        };
        let duration = started.elapsed();

        if let Some(cluster) = self.cluster(&cluster_id) {
            cluster.record_query(duration, result.is_ok());
        }

        result
    }

    /// Run a closure inside a transaction on a single cluster.
    pub async fn transaction<T, F>(&self, f: F, options: &QueryOptions) -> Result<T, Error>
    where
        F: for<'a> FnOnce(&'a mut Guard) -> BoxFuture<'a, Result<T, Error>>,
    {
        let mut write_options = options.clone();
        write_options.operation = Some(Operation::Write);

        let mut conn = self.get_connection(&write_options).await?;
        conn.execute("BEGIN", &[]).await?;

        match f(&mut conn).await {
            Ok(value) => {
                conn.execute("COMMIT", &[]).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK", &[]).await {
                    warn!(
                        "rollback failed: {} [{}]",
                        rollback_err,
                        conn.metadata().pool_id
                    );
                }
                Err(err)
            }
        }
    }

    pub fn cluster(&self, id: &str) -> Option<Cluster> {
        self.inner.clusters.read().get(id).cloned()
    }

    pub fn get_clusters(&self) -> Vec<ClusterInfo> {
        self.inner
            .clusters
            .read()
            .values()
            .map(|cluster| ClusterInfo {
                id: cluster.id().to_string(),
                status: cluster.status(),
                schemas: cluster.schemas().to_vec(),
                replicas: cluster.replicas().len(),
            })
            .collect()
    }

    /// Pool metrics per cluster.
    pub fn get_metrics(&self) -> FnvHashMap<String, Vec<PoolInfo>> {
        self.inner
            .clusters
            .read()
            .values()
            .map(|cluster| {
                (
                    cluster.id().to_string(),
                    cluster.all_pools().iter().map(|pool| pool.info()).collect(),
                )
            })
            .collect()
    }

    /// Query statistics per cluster.
    pub fn get_stats(&self) -> FnvHashMap<String, ClusterStats> {
        self.inner
            .clusters
            .read()
            .values()
            .map(|cluster| (cluster.id().to_string(), cluster.stats()))
            .collect()
    }

    pub fn get_cluster_health(&self, id: &str) -> Option<ClusterHealth> {
        self.inner.health.get_health(id)
    }

    pub fn all_health(&self) -> FnvHashMap<String, ClusterHealth> {
        self.inner.health.all_health()
    }

    pub async fn force_health_check(&self, id: &str) -> Option<ClusterHealth> {
        self.inner.health.force_check(id).await
    }

    /// Promote a replica to primary.
    pub fn force_failover(&self, id: &str, replica_index: usize) -> Result<(), Error> {
        let cluster = self
            .cluster(id)
            .ok_or_else(|| Error::UnknownCluster(id.to_string()))?;

        let (old_primary, new_primary) = cluster
            .failover(replica_index)
            .ok_or_else(|| Error::NoSuchReplica(id.to_string(), replica_index))?;

        info!(
            "failover: {} promoted over {} [{}]",
            new_primary, old_primary, id
        );
        self.inner.events.emit(Event::Failover {
            cluster_id: id.to_string(),
            new_primary,
            old_primary,
        });

        Ok(())
    }

    /// Total connections checked out across clusters.
    pub fn active_connections(&self) -> usize {
        self.inner
            .clusters
            .read()
            .values()
            .map(|cluster| cluster.active_connections())
            .sum()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> &Events {
        &self.inner.events
    }

    /// Stop health checks and close every pool.
    pub async fn close(&self) {
        self.inner.health.stop();

        let clusters: Vec<Cluster> = self.inner.clusters.write().drain(..).map(|(_, c)| c).collect();
        for cluster in clusters {
            cluster.close().await;
        }

        self.inner.schema_map.write().clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::backend::mock::MockDriver;
    use crate::events;

    /// Two clusters: "a" (primary + 2 replicas) serving "users",
    /// "b" (primary only) serving "orders".
    pub(crate) fn two_cluster_config() -> Config {
        Config::from_json(
            r#"{
                "a": {
                    "schemas": ["users"],
                    "primary": {"host": "primary-a", "database": "app", "user": "app", "password": "p"},
                    "replicas": [
                        {"host": "replica-a-0", "database": "app", "user": "app", "password": "p"},
                        {"host": "replica-a-1", "database": "app", "user": "app", "password": "p"}
                    ],
                    "connectionPool": {"acquireTimeoutMillis": 500}
                },
                "b": {
                    "schemas": ["orders"],
                    "primary": {"host": "primary-b", "database": "app", "user": "app", "password": "p"},
                    "connectionPool": {"acquireTimeoutMillis": 500}
                }
            }"#,
        )
        .unwrap()
    }

    pub(crate) async fn manager(driver: &MockDriver) -> ClusterManager {
        let manager = ClusterManager::with_health_interval(
            Arc::new(driver.clone()),
            Events::new(),
            Duration::from_secs(600),
        );
        manager.initialize(&two_cluster_config()).await.unwrap();
        driver.clear_log();
        manager
    }

    #[tokio::test]
    async fn test_schema_routing() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        // users → cluster a, orders → cluster b.
        manager
            .execute_query("INSERT INTO t VALUES (1)", &[], &QueryOptions::schema("users").write())
            .await
            .unwrap();
        manager
            .execute_query("INSERT INTO t VALUES (1)", &[], &QueryOptions::schema("orders").write())
            .await
            .unwrap();

        assert_eq!(driver.executed_on("primary-a").len(), 1);
        assert_eq!(driver.executed_on("primary-b").len(), 1);

        let err = manager
            .execute_query("SELECT 1", &[], &QueryOptions::schema("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSchema(_)));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_read_write_split() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        // Six eventual reads alternate over the two replicas.
        for _ in 0..6 {
            manager
                .execute_query("SELECT * FROM users", &[], &QueryOptions::schema("users"))
                .await
                .unwrap();
        }
        assert_eq!(driver.executed_on("replica-a-0").len(), 3);
        assert_eq!(driver.executed_on("replica-a-1").len(), 3);
        assert_eq!(driver.executed_on("primary-a").len(), 0);

        // Strong reads and writes go to the primary.
        manager
            .execute_query(
                "SELECT * FROM users",
                &[],
                &QueryOptions::schema("users").consistency(ConsistencyLevel::Strong),
            )
            .await
            .unwrap();
        manager
            .execute_query(
                "UPDATE users SET x = 1",
                &[],
                &QueryOptions::schema("users"),
            )
            .await
            .unwrap();
        assert_eq!(driver.executed_on("primary-a").len(), 2);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_replica_order_alternates() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        let mut hosts = vec![];
        for _ in 0..4 {
            let conn = manager
                .get_connection(&QueryOptions::schema("users"))
                .await
                .unwrap();
            hosts.push(conn.metadata().pool_id.clone());
        }

        assert_eq!(
            hosts,
            vec!["a_replica_0", "a_replica_1", "a_replica_0", "a_replica_1"]
        );

        manager.close().await;
    }

    #[tokio::test]
    async fn test_no_schema_picks_first_active_cluster() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        let conn = manager
            .get_connection(&QueryOptions::default().write())
            .await
            .unwrap();
        assert_eq!(conn.metadata().cluster_id, "a");
        drop(conn);

        // Mark the first cluster down; routing moves to the next one.
        manager.cluster("a").unwrap().set_status(ClusterStatus::Down);
        let conn = manager
            .get_connection(&QueryOptions::default().write())
            .await
            .unwrap();
        assert_eq!(conn.metadata().cluster_id, "b");
        drop(conn);

        manager.cluster("b").unwrap().set_status(ClusterStatus::Down);
        let err = manager
            .get_connection(&QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveCluster));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_inactive_cluster_rejected_unless_explicit() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        manager
            .cluster("a")
            .unwrap()
            .set_status(ClusterStatus::Maintenance);

        let err = manager
            .get_connection(&QueryOptions::schema("users"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClusterNotActive(_, _)));

        // Explicit targeting bypasses the status check.
        let conn = manager
            .get_connection(&QueryOptions::cluster("a").write())
            .await
            .unwrap();
        assert_eq!(conn.metadata().cluster_id, "a");

        manager.close().await;
    }

    #[tokio::test]
    async fn test_failed_replica_degrades_cluster() {
        crate::logger();
        let driver = MockDriver::new();
        driver.fail_connect("replica-a-1");

        let manager = ClusterManager::with_health_interval(
            Arc::new(driver.clone()),
            Events::new(),
            Duration::from_secs(600),
        );
        manager.initialize(&two_cluster_config()).await.unwrap();

        let cluster = manager.cluster("a").unwrap();
        assert_eq!(cluster.replicas().len(), 1);
        assert!(cluster.is_active());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_failed_primary_fails_registration() {
        crate::logger();
        let driver = MockDriver::new();
        driver.fail_connect("primary-b");

        let manager = ClusterManager::with_health_interval(
            Arc::new(driver.clone()),
            Events::new(),
            Duration::from_secs(600),
        );
        let err = manager.initialize(&two_cluster_config()).await.unwrap_err();
        assert!(matches!(err, Error::Pool(_)));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_force_failover() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;
        let mut rx = manager.events().subscribe();

        manager.force_failover("a", 0).unwrap();

        let cluster = manager.cluster("a").unwrap();
        assert_eq!(cluster.primary().id().to_string(), "a_replica_0");
        // Ex-primary joined the replica tail.
        let replicas: Vec<String> = cluster
            .replicas()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(replicas, vec!["a_replica_1", "a_primary"]);

        let seen = events::drain(&mut rx);
        assert!(seen.iter().any(|e| e.kind() == "failover"));

        let err = manager.force_failover("a", 9).unwrap_err();
        assert!(matches!(err, Error::NoSuchReplica(_, 9)));

        manager.close().await;
    }

    #[tokio::test]
    async fn test_stats_accrue() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        manager
            .execute_query("SELECT 1", &[], &QueryOptions::schema("orders"))
            .await
            .unwrap();
        driver.fail_sql("primary-b", "INSERT");
        let _ = manager
            .execute_query("INSERT INTO t VALUES (1)", &[], &QueryOptions::schema("orders"))
            .await
            .unwrap_err();

        let stats = manager.get_stats();
        let b = stats.get("b").unwrap();
        assert_eq!(b.queries, 2);
        assert_eq!(b.errors, 1);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_update_config_removes_and_adds() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        let updated = Config::from_json(
            r#"{
                "a": {
                    "schemas": ["users"],
                    "primary": {"host": "primary-a", "database": "app", "user": "app", "password": "p"},
                    "replicas": [
                        {"host": "replica-a-0", "database": "app", "user": "app", "password": "p"},
                        {"host": "replica-a-1", "database": "app", "user": "app", "password": "p"}
                    ],
                    "connectionPool": {"acquireTimeoutMillis": 500}
                },
                "c": {
                    "schemas": ["billing"],
                    "primary": {"host": "primary-c", "database": "app", "user": "app", "password": "p"},
                    "connectionPool": {"acquireTimeoutMillis": 500}
                }
            }"#,
        )
        .unwrap();

        manager.update_config(&updated).await.unwrap();

        assert!(manager.cluster("b").is_none());
        assert!(manager.cluster("c").is_some());
        assert_eq!(manager.schema_cluster("orders"), None);
        assert_eq!(manager.schema_cluster("billing"), Some("c".into()));
        // Unchanged cluster left alone.
        assert!(manager.cluster("a").is_some());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_not_initialized() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = ClusterManager::new(Arc::new(driver), Events::new());

        let err = manager
            .get_connection(&QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_health_transitions() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;
        let mut rx = manager.events().subscribe();

        let health = manager.force_health_check("b").await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.failure_count, 0);

        driver.set_down("primary-b", true);
        let health = manager.force_health_check("b").await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.failure_count, 1);
        assert!(health.error.is_some());
        assert_eq!(
            manager.cluster("b").unwrap().status(),
            ClusterStatus::Down
        );

        let health = manager.force_health_check("b").await.unwrap();
        assert_eq!(health.failure_count, 2);

        driver.set_down("primary-b", false);
        let health = manager.force_health_check("b").await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.failure_count, 0);
        assert!(manager.cluster("b").unwrap().is_active());

        let kinds: Vec<&str> = events::drain(&mut rx)
            .iter()
            .map(|e| e.kind())
            .filter(|k| k.starts_with("cluster"))
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["clusterDown", "clusterRecovered", "clusterUp"]);

        manager.close().await;
    }

    #[tokio::test]
    async fn test_single_cluster_transaction() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        let rows = manager
            .transaction(
                |conn| {
                    Box::pin(async move {
                        conn.execute("INSERT INTO t VALUES (1)", &[]).await?;
                        let result = conn.execute("SELECT 1", &[]).await?;
                        Ok(result.rows.len())
                    })
                },
                &QueryOptions::schema("users"),
            )
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let seen = driver.executed_on("primary-a");
        assert_eq!(
            seen,
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "SELECT 1", "COMMIT"]
        );

        // A failing closure rolls back.
        driver.clear_log();
        let result: Result<(), Error> = manager
            .transaction(
                |conn| {
                    Box::pin(async move {
                        conn.execute("INSERT INTO t VALUES (2)", &[]).await?;
                        Err(Error::NoActiveCluster)
                    })
                },
                &QueryOptions::schema("users"),
            )
            .await;
        assert!(result.is_err());

        let seen = driver.executed_on("primary-a");
        assert_eq!(seen.last().unwrap(), "ROLLBACK");

        manager.close().await;
    }

    #[tokio::test]
    async fn test_active_connections_gauge() {
        crate::logger();
        let driver = MockDriver::new();
        let manager = manager(&driver).await;

        let a = manager
            .get_connection(&QueryOptions::schema("users"))
            .await
            .unwrap();
        let b = manager
            .get_connection(&QueryOptions::schema("orders"))
            .await
            .unwrap();
        assert_eq!(manager.active_connections(), 2);

        drop(a);
        drop(b);
        assert_eq!(manager.active_connections(), 0);

        manager.close().await;
    }
}
