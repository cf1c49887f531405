//! Versioned schema migrations across clusters and schemas.

pub mod error;
pub mod loader;
pub mod migration;
pub mod plan;
pub mod store;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::ClusterManager;
use crate::events::{Event, Events};

pub use error::Error;
pub use migration::{Migration, MigrationContext, MigrationFn, MigrationStep};
pub use store::{MigrationLock, MigrationRecord, MigrationStorage, SqlMigrationStorage};

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub directory: PathBuf,
    pub table: String,
    pub lock_table: String,
    /// TTL on migration locks; stale rows past it may be overwritten.
    pub lock_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("migrations"),
            table: "pgm_migrations".into(),
            lock_table: "pgm_migrations_lock".into(),
            lock_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    /// Apply only versions up to and including this one.
    pub target_version: Option<String>,
    pub schemas: Option<Vec<String>>,
    pub clusters: Option<Vec<String>>,
    /// Plan without executing.
    pub dry_run: bool,
    /// Skip the dependency check and missing-migration errors.
    pub force: bool,
    /// Record failures and keep going.
    pub continue_on_error: bool,
    /// Run (schema, cluster) lanes concurrently.
    pub parallel: bool,
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Roll back everything above this version.
    pub target_version: Option<String>,
    /// Without a target version, roll back this many migrations.
    pub steps: usize,
    pub schemas: Option<Vec<String>>,
    pub clusters: Option<Vec<String>>,
    pub dry_run: bool,
    /// Skip rows whose migration is no longer registered.
    pub force: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            target_version: None,
            steps: 1,
            schemas: None,
            clusters: None,
            dry_run: false,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub schemas: Vec<String>,
    pub clusters: Option<Vec<String>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
    pub schema: String,
    pub cluster_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedMigration {
    pub version: String,
    pub schema: String,
    pub cluster_id: String,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedMigration {
    pub version: String,
    pub schema: String,
    pub cluster_id: String,
    pub error: String,
}

/// What `migrate`/`rollback`/`get_status` report.
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    /// Rows already recorded in the migrations tables.
    pub applied: Vec<MigrationRecord>,
    /// Still to run (or to roll back, for rollbacks).
    pub pending: Vec<PendingMigration>,
    /// Work done by this invocation.
    pub executed: Vec<ExecutedMigration>,
    pub failed: Vec<FailedMigration>,
}

impl MigrationStatus {
    pub fn applied_migrations(&self) -> usize {
        self.applied.len()
    }

    pub fn pending_migrations(&self) -> usize {
        self.pending.len()
    }
}

struct Lane {
    schema: String,
    cluster: String,
    pending: Vec<Migration>,
}

struct MigrateInner {
    manager: ClusterManager,
    storage: Arc<dyn MigrationStorage>,
    config: MigrationConfig,
    migrations: RwLock<BTreeMap<String, Migration>>,
    events: Events,
    initialized: AtomicBool,
    /// Lock owner identity for this process.
    instance: String,
}

/// Migration engine handle. Cheap to clone.
#[derive(Clone)]
pub struct MigrationManager {
    inner: Arc<MigrateInner>,
}

impl MigrationManager {
    pub fn new(manager: ClusterManager, config: MigrationConfig, events: Events) -> Self {
        let storage = Arc::new(SqlMigrationStorage::new(
            manager.clone(),
            &config.table,
            &config.lock_table,
        ));
        Self::with_storage(manager, config, storage, events)
    }

    /// Swap in different persistence, e.g. for tests.
    pub fn with_storage(
        manager: ClusterManager,
        config: MigrationConfig,
        storage: Arc<dyn MigrationStorage>,
        events: Events,
    ) -> Self {
        Self {
            inner: Arc::new(MigrateInner {
                manager,
                storage,
                config,
                migrations: RwLock::new(BTreeMap::new()),
                events,
                initialized: AtomicBool::new(false),
                instance: Uuid::new_v4().to_string(),
            }),
        }
    }

    /// Create the persistence tables on every cluster and load the
    /// migrations directory.
    pub async fn initialize(&self) -> Result<(), Error> {
        for cluster in self.inner.manager.get_clusters() {
            self.inner.storage.ensure(&cluster.id).await?;
        }

        let loaded = loader::load_dir(&self.inner.config.directory)?;
        let count = loaded.len();
        {
            let mut migrations = self.inner.migrations.write();
            for migration in loaded {
                migrations.insert(migration.version.clone(), migration);
            }
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        debug!("migration manager initialized, {} migrations on disk", count);

        Ok(())
    }

    pub fn add_migration(&self, migration: Migration) -> Result<(), Error> {
        migration.validate()?;

        let mut migrations = self.inner.migrations.write();
        if migrations.contains_key(&migration.version) {
            return Err(Error::Duplicate(migration.version));
        }
        migrations.insert(migration.version.clone(), migration);

        Ok(())
    }

    pub fn remove_migration(&self, version: &str) -> Result<(), Error> {
        self.inner
            .migrations
            .write()
            .remove(version)
            .map(|_| ())
            .ok_or_else(|| Error::UnknownVersion(version.to_string()))
    }

    /// Registered migrations, ascending by version.
    pub fn get_migrations(&self) -> Vec<Migration> {
        self.inner.migrations.read().values().cloned().collect()
    }

    /// Write a migration file template and register it.
    pub fn create_migration(
        &self,
        name: &str,
        options: &CreateOptions,
    ) -> Result<PathBuf, Error> {
        let name: String = name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let version = loader::version_now();

        let schemas = if options.schemas.is_empty() {
            self.inner.manager.schemas()
        } else {
            options.schemas.clone()
        };
        let content = loader::template(
            &schemas,
            options.clusters.as_deref(),
            options.description.as_deref(),
        );

        std::fs::create_dir_all(&self.inner.config.directory)?;
        let path = self
            .inner
            .config
            .directory
            .join(format!("{}_{}.sql", version, name));
        std::fs::write(&path, &content)?;

        info!("created migration {}", path.display());

        Ok(path)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self, options: &MigrateOptions) -> Result<MigrationStatus, Error> {
        self.ensure_initialized()?;

        let targets = self.targets(options.schemas.as_deref(), options.clusters.as_deref())?;
        let migrations = self.inner.migrations.read().clone();

        let mut status = MigrationStatus::default();
        let mut lanes: Vec<Lane> = vec![];
        let mut applied_by_schema: HashMap<String, HashSet<String>> = HashMap::new();

        for (schema, cluster) in &targets {
            let rows = self.inner.storage.applied(cluster, schema).await?;
            let applied: HashSet<String> = rows.iter().map(|row| row.version.clone()).collect();
            applied_by_schema
                .entry(schema.clone())
                .or_default()
                .extend(applied.iter().cloned());
            status.applied.extend(rows);

            let pending = plan::pending(
                &migrations,
                schema,
                cluster,
                &applied,
                options.target_version.as_deref(),
            );
            status.pending.extend(pending.iter().map(|m| PendingMigration {
                version: m.version.clone(),
                name: m.name.clone(),
                schema: schema.clone(),
                cluster_id: cluster.clone(),
            }));

            lanes.push(Lane {
                schema: schema.clone(),
                cluster: cluster.clone(),
                pending: pending.into_iter().cloned().collect(),
            });
        }

        if !options.force {
            let planned: BTreeMap<String, &Migration> = lanes
                .iter()
                .flat_map(|lane| lane.pending.iter())
                .map(|m| (m.version.clone(), m))
                .collect();
            plan::check_dependencies(&planned, &applied_by_schema)?;
        }

        if options.dry_run {
            return Ok(status);
        }

        let mut batch = 0;
        let clusters: HashSet<&String> = targets.iter().map(|(_, cluster)| cluster).collect();
        for cluster in clusters {
            batch = batch.max(self.inner.storage.max_batch(cluster).await?);
        }
        let batch = batch + 1;

        if options.parallel {
            let max_parallel = options.max_parallel.unwrap_or(4).max(1);
            for chunk in lanes.chunks(max_parallel) {
                let results = join_all(
                    chunk
                        .iter()
                        .map(|lane| self.run_lane(lane, batch, options.continue_on_error)),
                )
                .await;

                for (executed, failed, error) in results {
                    status.executed.extend(executed);
                    status.failed.extend(failed);
                    if let Some(error) = error {
                        if !options.continue_on_error {
                            return Err(error);
                        }
                    }
                }
            }
        } else {
            for lane in &lanes {
                let (executed, failed, error) =
                    self.run_lane(lane, batch, options.continue_on_error).await;
                status.executed.extend(executed);
                status.failed.extend(failed);
                if let Some(error) = error {
                    if !options.continue_on_error {
                        return Err(error);
                    }
                }
            }
        }

        Ok(status)
    }

    /// Run one lane's migrations in version order.
    async fn run_lane(
        &self,
        lane: &Lane,
        batch: i64,
        continue_on_error: bool,
    ) -> (Vec<ExecutedMigration>, Vec<FailedMigration>, Option<Error>) {
        let mut executed = vec![];
        let mut failed = vec![];

        for migration in &lane.pending {
            match self
                .execute_one(migration, &lane.schema, &lane.cluster, batch)
                .await
            {
                Ok(execution_time) => executed.push(ExecutedMigration {
                    version: migration.version.clone(),
                    schema: lane.schema.clone(),
                    cluster_id: lane.cluster.clone(),
                    execution_time,
                }),
                Err(error) => {
                    failed.push(FailedMigration {
                        version: migration.version.clone(),
                        schema: lane.schema.clone(),
                        cluster_id: lane.cluster.clone(),
                        error: error.to_string(),
                    });
                    if !continue_on_error {
                        return (executed, failed, Some(error));
                    }
                }
            }
        }

        (executed, failed, None)
    }

    /// Lock, run `up`, record, release.
    async fn execute_one(
        &self,
        migration: &Migration,
        schema: &str,
        cluster: &str,
        batch: i64,
    ) -> Result<Duration, Error> {
        self.inner.events.emit(Event::MigrationStarted {
            version: migration.version.clone(),
            schema: schema.to_string(),
            cluster_id: cluster.to_string(),
        });

        let locked = self.acquire_locks(&migration.version, schema, cluster).await?;

        let mut context =
            MigrationContext::new(self.inner.manager.clone(), schema, cluster, &migration.version);
        let started = Instant::now();
        let result = migration.up.run(&mut context).await;
        let execution_time = started.elapsed();

        let outcome = match result {
            Ok(()) => {
                let record = MigrationRecord {
                    version: migration.version.clone(),
                    name: migration.name.clone(),
                    schema: schema.to_string(),
                    cluster_id: cluster.to_string(),
                    executed_at: Utc::now(),
                    execution_time,
                    checksum: migration.checksum(),
                    batch,
                };
                self.inner.storage.record(&record).await.map(|_| execution_time)
            }
            Err(err) => Err(Error::ExecutionFailed(
                migration.version.clone(),
                err.to_string(),
            )),
        };

        self.release_locks(&locked).await;

        match &outcome {
            Ok(duration) => {
                info!(
                    "migration {} applied in {:?} [{}.{}]",
                    migration.version, duration, cluster, schema
                );
                self.inner.events.emit(Event::MigrationCompleted {
                    version: migration.version.clone(),
                    schema: schema.to_string(),
                    cluster_id: cluster.to_string(),
                    duration: *duration,
                });
            }
            Err(err) => {
                self.inner.events.emit(Event::MigrationFailed {
                    version: migration.version.clone(),
                    schema: schema.to_string(),
                    cluster_id: cluster.to_string(),
                    error: err.to_string(),
                });
            }
        }

        outcome
    }

    /// Take the lock on the target cluster; fan out to the others
    /// best-effort. Returns (cluster, lock_key) pairs to release.
    async fn acquire_locks(
        &self,
        version: &str,
        schema: &str,
        cluster: &str,
    ) -> Result<Vec<(String, String)>, Error> {
        let lock_key = format!("{}-{}-{}", version, schema, cluster);
        let now = Utc::now();
        let lock = MigrationLock {
            lock_key: lock_key.clone(),
            locked_by: self.inner.instance.clone(),
            locked_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.inner.config.lock_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        };

        if !self.inner.storage.acquire_lock(cluster, &lock).await? {
            return Err(Error::LockFailed(lock_key));
        }

        let mut locked = vec![(cluster.to_string(), lock_key.clone())];

        for other in self.inner.manager.get_clusters() {
            if other.id == cluster {
                continue;
            }
            match self.inner.storage.acquire_lock(&other.id, &lock).await {
                Ok(true) => locked.push((other.id.clone(), lock_key.clone())),
                Ok(false) => warn!("lock \"{}\" already held [{}]", lock_key, other.id),
                Err(err) => warn!("lock fan-out failed: {} [{}]", err, other.id),
            }
        }

        Ok(locked)
    }

    async fn release_locks(&self, locked: &[(String, String)]) {
        for (cluster, lock_key) in locked {
            if let Err(err) = self
                .inner
                .storage
                .release_lock(cluster, lock_key, &self.inner.instance)
                .await
            {
                warn!("lock release failed: {} [{}]", err, cluster);
            }
        }
    }

    /// Undo applied migrations, newest first.
    pub async fn rollback(&self, options: &RollbackOptions) -> Result<MigrationStatus, Error> {
        self.ensure_initialized()?;

        let targets = self.targets(options.schemas.as_deref(), options.clusters.as_deref())?;
        let migrations = self.inner.migrations.read().clone();
        let mut status = MigrationStatus::default();

        for (schema, cluster) in &targets {
            let mut rows = self.inner.storage.applied(cluster, schema).await?;
            rows.reverse();

            let selected: Vec<MigrationRecord> = match &options.target_version {
                Some(target) => rows
                    .into_iter()
                    .filter(|row| row.version.as_str() > target.as_str())
                    .collect(),
                None => rows.into_iter().take(options.steps).collect(),
            };

            status.pending.extend(selected.iter().map(|row| PendingMigration {
                version: row.version.clone(),
                name: row.name.clone(),
                schema: schema.clone(),
                cluster_id: cluster.clone(),
            }));

            if options.dry_run {
                continue;
            }

            for row in selected {
                let migration = match migrations.get(&row.version) {
                    Some(migration) => migration,
                    None if options.force => {
                        debug!("skipping unknown migration {} [{}]", row.version, cluster);
                        continue;
                    }
                    None => return Err(Error::UnknownVersion(row.version)),
                };

                self.inner.events.emit(Event::RollbackStarted {
                    version: row.version.clone(),
                    schema: schema.clone(),
                    cluster_id: cluster.clone(),
                });

                let locked = self.acquire_locks(&row.version, schema, cluster).await?;

                let mut context = MigrationContext::new(
                    self.inner.manager.clone(),
                    schema,
                    cluster,
                    &row.version,
                );
                let result = migration.down.run(&mut context).await;

                let outcome = match result {
                    Ok(()) => self
                        .inner
                        .storage
                        .remove(cluster, schema, &row.version)
                        .await,
                    Err(err) => Err(Error::RollbackFailed(row.version.clone(), err.to_string())),
                };

                self.release_locks(&locked).await;

                match outcome {
                    Ok(()) => {
                        info!("rolled back {} [{}.{}]", row.version, cluster, schema);
                        self.inner.events.emit(Event::RollbackCompleted {
                            version: row.version.clone(),
                            schema: schema.clone(),
                            cluster_id: cluster.clone(),
                        });
                        status.executed.push(ExecutedMigration {
                            version: row.version.clone(),
                            schema: schema.clone(),
                            cluster_id: cluster.clone(),
                            execution_time: Duration::ZERO,
                        });
                    }
                    Err(err) => {
                        self.inner.events.emit(Event::RollbackFailed {
                            version: row.version.clone(),
                            schema: schema.clone(),
                            cluster_id: cluster.clone(),
                            error: err.to_string(),
                        });
                        return Err(err);
                    }
                }
            }
        }

        Ok(status)
    }

    /// Applied and pending migrations without executing anything.
    pub async fn get_status(
        &self,
        schemas: Option<&[String]>,
        clusters: Option<&[String]>,
    ) -> Result<MigrationStatus, Error> {
        self.ensure_initialized()?;

        let targets = self.targets(schemas, clusters)?;
        let migrations = self.inner.migrations.read().clone();
        let mut status = MigrationStatus::default();

        for (schema, cluster) in &targets {
            let rows = self.inner.storage.applied(cluster, schema).await?;
            let applied: HashSet<String> = rows.iter().map(|row| row.version.clone()).collect();
            status.applied.extend(rows);

            let pending = plan::pending(&migrations, schema, cluster, &applied, None);
            status.pending.extend(pending.iter().map(|m| PendingMigration {
                version: m.version.clone(),
                name: m.name.clone(),
                schema: schema.clone(),
                cluster_id: cluster.clone(),
            }));
        }

        Ok(status)
    }

    pub fn close(&self) {
        self.inner.initialized.store(false, Ordering::SeqCst);
    }

    fn ensure_initialized(&self) -> Result<(), Error> {
        if self.inner.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    /// (schema, cluster) pairs in scope, sorted by schema.
    fn targets(
        &self,
        schemas: Option<&[String]>,
        clusters: Option<&[String]>,
    ) -> Result<Vec<(String, String)>, Error> {
        let schemas: Vec<String> = match schemas {
            Some(schemas) => schemas.to_vec(),
            None => self.inner.manager.schemas(),
        };

        let mut targets = vec![];
        for schema in schemas {
            let cluster = self
                .inner
                .manager
                .schema_cluster(&schema)
                .ok_or_else(|| crate::backend::manager::Error::UnknownSchema(schema.clone()))?;

            let in_scope = clusters
                .map(|clusters| clusters.iter().any(|c| *c == cluster))
                .unwrap_or(true);
            if in_scope {
                targets.push((schema, cluster));
            }
        }
        targets.sort();

        Ok(targets)
    }
}
