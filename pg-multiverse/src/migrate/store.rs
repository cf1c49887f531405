//! Migration persistence.
//!
//! Applied migrations and locks live in two tables on every cluster.
//! The trait keeps the engine testable; production uses the SQL-backed
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::backend::driver::QueryResult;
use crate::backend::request::{Operation, QueryOptions};
use crate::backend::ClusterManager;

use super::Error;

/// Row of the migrations table, unique on (version, schema, cluster).
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    pub schema: String,
    pub cluster_id: String,
    pub executed_at: DateTime<Utc>,
    pub execution_time: Duration,
    pub checksum: String,
    pub batch: i64,
}

/// Row of the lock table. Rows past `expires_at` may be overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationLock {
    pub lock_key: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait MigrationStorage: Send + Sync {
    /// Create the tables on the cluster if they don't exist.
    async fn ensure(&self, cluster: &str) -> Result<(), Error>;

    /// Applied rows for a schema on a cluster, ascending by version.
    async fn applied(&self, cluster: &str, schema: &str) -> Result<Vec<MigrationRecord>, Error>;

    async fn record(&self, record: &MigrationRecord) -> Result<(), Error>;

    async fn remove(&self, cluster: &str, schema: &str, version: &str) -> Result<(), Error>;

    /// Upsert that only overwrites expired rows. Returns whether the
    /// lock was taken.
    async fn acquire_lock(&self, cluster: &str, lock: &MigrationLock) -> Result<bool, Error>;

    async fn release_lock(
        &self,
        cluster: &str,
        lock_key: &str,
        locked_by: &str,
    ) -> Result<(), Error>;

    async fn max_batch(&self, cluster: &str) -> Result<i64, Error>;
}

/// SQL-backed storage going through the cluster manager.
pub struct SqlMigrationStorage {
    manager: ClusterManager,
    table: String,
    lock_table: String,
}

impl SqlMigrationStorage {
    pub fn new(manager: ClusterManager, table: &str, lock_table: &str) -> Self {
        Self {
            manager,
            table: table.to_string(),
            lock_table: lock_table.to_string(),
        }
    }

    async fn execute(
        &self,
        cluster: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<QueryResult, Error> {
        let mut options = QueryOptions::cluster(cluster);
        options.operation = Some(Operation::Write);

        Ok(self.manager.execute_query(sql, params, &options).await?)
    }

    fn parse_record(result: &QueryResult, row: usize) -> Option<MigrationRecord> {
        let text = |column: &str| -> Option<String> {
            result
                .value(row, column)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let int = |column: &str| -> i64 {
            result
                .value(row, column)
                .and_then(|v| v.as_i64())
                .unwrap_or(0)
        };

        Some(MigrationRecord {
            version: text("version")?,
            name: text("name").unwrap_or_default(),
            schema: text("schema_name")?,
            cluster_id: text("cluster_id")?,
            executed_at: text("executed_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            execution_time: Duration::from_millis(int("execution_time") as u64),
            checksum: text("checksum").unwrap_or_default(),
            batch: int("batch"),
        })
    }
}

#[async_trait]
impl MigrationStorage for SqlMigrationStorage {
    async fn ensure(&self, cluster: &str) -> Result<(), Error> {
        self.execute(
            cluster,
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 version TEXT NOT NULL, \
                 name TEXT NOT NULL, \
                 schema_name TEXT NOT NULL, \
                 cluster_id TEXT NOT NULL, \
                 executed_at TIMESTAMPTZ NOT NULL, \
                 execution_time BIGINT NOT NULL, \
                 checksum TEXT NOT NULL, \
                 batch BIGINT NOT NULL, \
                 PRIMARY KEY (version, schema_name, cluster_id))",
                self.table
            ),
            &[],
        )
        .await?;

        self.execute(
            cluster,
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 lock_key TEXT PRIMARY KEY, \
                 locked_by TEXT NOT NULL, \
                 locked_at TIMESTAMPTZ NOT NULL, \
                 expires_at TIMESTAMPTZ NOT NULL)",
                self.lock_table
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn applied(&self, cluster: &str, schema: &str) -> Result<Vec<MigrationRecord>, Error> {
        let result = self
            .execute(
                cluster,
                &format!(
                    "SELECT version, name, schema_name, cluster_id, executed_at, \
                     execution_time, checksum, batch FROM {} \
                     WHERE schema_name = $1 AND cluster_id = $2 ORDER BY version",
                    self.table
                ),
                &[json!(schema), json!(cluster)],
            )
            .await?;

        Ok((0..result.rows.len())
            .filter_map(|row| Self::parse_record(&result, row))
            .collect())
    }

    async fn record(&self, record: &MigrationRecord) -> Result<(), Error> {
        self.execute(
            &record.cluster_id,
            &format!(
                "INSERT INTO {} (version, name, schema_name, cluster_id, executed_at, \
                 execution_time, checksum, batch) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                self.table
            ),
            &[
                json!(record.version),
                json!(record.name),
                json!(record.schema),
                json!(record.cluster_id),
                json!(record.executed_at.to_rfc3339()),
                json!(record.execution_time.as_millis() as i64),
                json!(record.checksum),
                json!(record.batch),
            ],
        )
        .await?;

        Ok(())
    }

    async fn remove(&self, cluster: &str, schema: &str, version: &str) -> Result<(), Error> {
        self.execute(
            cluster,
            &format!(
                "DELETE FROM {} WHERE version = $1 AND schema_name = $2 AND cluster_id = $3",
                self.table
            ),
            &[json!(version), json!(schema), json!(cluster)],
        )
        .await?;

        Ok(())
    }

    async fn acquire_lock(&self, cluster: &str, lock: &MigrationLock) -> Result<bool, Error> {
        let result = self
            .execute(
                cluster,
                &format!(
                    "INSERT INTO {table} (lock_key, locked_by, locked_at, expires_at) \
                     VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (lock_key) DO UPDATE SET \
                     locked_by = EXCLUDED.locked_by, \
                     locked_at = EXCLUDED.locked_at, \
                     expires_at = EXCLUDED.expires_at \
                     WHERE {table}.expires_at < $3",
                    table = self.lock_table
                ),
                &[
                    json!(lock.lock_key),
                    json!(lock.locked_by),
                    json!(lock.locked_at.to_rfc3339()),
                    json!(lock.expires_at.to_rfc3339()),
                ],
            )
            .await?;

        Ok(result.rows_affected > 0)
    }

    async fn release_lock(
        &self,
        cluster: &str,
        lock_key: &str,
        locked_by: &str,
    ) -> Result<(), Error> {
        self.execute(
            cluster,
            &format!(
                "DELETE FROM {} WHERE lock_key = $1 AND locked_by = $2",
                self.lock_table
            ),
            &[json!(lock_key), json!(locked_by)],
        )
        .await?;

        Ok(())
    }

    async fn max_batch(&self, cluster: &str) -> Result<i64, Error> {
        let result = self
            .execute(
                cluster,
                &format!("SELECT COALESCE(MAX(batch), 0) AS batch FROM {}", self.table),
                &[],
            )
            .await?;

        Ok(result
            .scalar()
            .and_then(|value| value.as_i64())
            .unwrap_or(0))
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory storage for engine tests.

    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct MemoryMigrationStorage {
        records: Mutex<Vec<MigrationRecord>>,
        locks: Mutex<HashMap<(String, String), MigrationLock>>,
        /// Lock keys to refuse, for contention tests.
        deny: Mutex<Vec<String>>,
    }

    impl MemoryMigrationStorage {
        pub fn deny_lock(&self, lock_key: &str) {
            self.deny.lock().push(lock_key.to_string());
        }

        pub fn records(&self) -> Vec<MigrationRecord> {
            self.records.lock().clone()
        }

        pub fn locks_held(&self) -> usize {
            self.locks.lock().len()
        }
    }

    #[async_trait]
    impl MigrationStorage for MemoryMigrationStorage {
        async fn ensure(&self, _cluster: &str) -> Result<(), Error> {
            Ok(())
        }

        async fn applied(
            &self,
            cluster: &str,
            schema: &str,
        ) -> Result<Vec<MigrationRecord>, Error> {
            let mut rows: Vec<MigrationRecord> = self
                .records
                .lock()
                .iter()
                .filter(|r| r.cluster_id == cluster && r.schema == schema)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.version.cmp(&b.version));
            Ok(rows)
        }

        async fn record(&self, record: &MigrationRecord) -> Result<(), Error> {
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn remove(&self, cluster: &str, schema: &str, version: &str) -> Result<(), Error> {
            self.records.lock().retain(|r| {
                !(r.cluster_id == cluster && r.schema == schema && r.version == version)
            });
            Ok(())
        }

        async fn acquire_lock(&self, cluster: &str, lock: &MigrationLock) -> Result<bool, Error> {
            if self.deny.lock().contains(&lock.lock_key) {
                return Ok(false);
            }

            let mut locks = self.locks.lock();
            let key = (cluster.to_string(), lock.lock_key.clone());

            match locks.get(&key) {
                Some(held) if held.expires_at > lock.locked_at => Ok(false),
                _ => {
                    locks.insert(key, lock.clone());
                    Ok(true)
                }
            }
        }

        async fn release_lock(
            &self,
            cluster: &str,
            lock_key: &str,
            locked_by: &str,
        ) -> Result<(), Error> {
            let mut locks = self.locks.lock();
            let key = (cluster.to_string(), lock_key.to_string());

            if let Some(held) = locks.get(&key) {
                if held.locked_by == locked_by {
                    locks.remove(&key);
                }
            }

            Ok(())
        }

        async fn max_batch(&self, cluster: &str) -> Result<i64, Error> {
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| r.cluster_id == cluster)
                .map(|r| r.batch)
                .max()
                .unwrap_or(0))
        }
    }
}
