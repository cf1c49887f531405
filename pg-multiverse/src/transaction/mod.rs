//! Distributed transactions.
//!
//! Single-cluster transactions commit locally; anything spanning more
//! than one cluster goes through two-phase commit with `PREPARE
//! TRANSACTION` / `COMMIT PREPARED`.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::Mutex;
use pg_multiverse_stats::TransactionMetrics;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::driver::QueryResult;
use crate::backend::request::{Operation, QueryOptions};
use crate::backend::{ClusterManager, Guard};
use crate::events::{Event, Events};

pub use error::Error;

use tracing::{debug, warn};

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        };

        write!(f, "{}", display)
    }
}

/// One statement inside a transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub schema: Option<String>,
    pub cluster_id: Option<String>,
}

impl TransactionStatement {
    pub fn on_schema(sql: &str, schema: &str) -> Self {
        Self {
            sql: sql.to_string(),
            schema: Some(schema.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Deadline for opening the transaction.
    pub timeout: Option<Duration>,
}

struct Transaction {
    id: Uuid,
    clusters: Vec<String>,
    state: TxState,
    connections: FnvHashMap<String, Guard>,
    started_at: Instant,
}

impl Transaction {
    fn prepared_name(&self) -> String {
        format!("pgm_{}", self.id.simple())
    }
}

struct TmInner {
    manager: ClusterManager,
    events: Events,
    transactions: Mutex<FnvHashMap<Uuid, Arc<AsyncMutex<Transaction>>>>,
    metrics: Mutex<TransactionMetrics>,
}

/// Transaction engine handle. Cheap to clone.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TmInner>,
}

impl TransactionManager {
    pub fn new(manager: ClusterManager, events: Events) -> Self {
        Self {
            inner: Arc::new(TmInner {
                manager,
                events,
                transactions: Mutex::new(FnvHashMap::default()),
                metrics: Mutex::new(TransactionMetrics::default()),
            }),
        }
    }

    /// Open a transaction across the clusters serving the schemas:
    /// one write connection per cluster, `BEGIN` issued on each.
    pub async fn begin(
        &self,
        schemas: &[String],
        options: &TransactionOptions,
    ) -> Result<Uuid, Error> {
        if schemas.is_empty() {
            return Err(Error::NoSchemas);
        }

        // Resolve the distinct clusters, preserving schema order.
        let mut clusters: Vec<String> = vec![];
        for schema in schemas {
            let cluster = self
                .inner
                .manager
                .schema_cluster(schema)
                .ok_or_else(|| crate::backend::manager::Error::UnknownSchema(schema.clone()))?;
            if !clusters.contains(&cluster) {
                clusters.push(cluster);
            }
        }

        let id = Uuid::new_v4();
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);

        {
            let mut metrics = self.inner.metrics.lock();
            metrics.total += 1;
            metrics.active += 1;
            if clusters.len() > 1 {
                metrics.distributed += 1;
            }
        }

        let mut connections: FnvHashMap<String, Guard> = FnvHashMap::default();

        for cluster in &clusters {
            if deadline.map(|d| Instant::now() > d).unwrap_or(false) {
                self.abort_begun(&mut connections).await;
                self.finish(Duration::ZERO, false);
                return Err(Error::Timeout);
            }

            let mut request = QueryOptions::cluster(cluster);
            request.operation = Some(Operation::Write);

            let mut conn = match self.inner.manager.get_connection(&request).await {
                Ok(conn) => conn,
                Err(err) => {
                    self.abort_begun(&mut connections).await;
                    self.finish(Duration::ZERO, false);
                    return Err(err.into());
                }
            };

            if let Err(err) = conn.execute("BEGIN", &[]).await {
                self.abort_begun(&mut connections).await;
                self.finish(Duration::ZERO, false);
                return Err(err.into());
            }

            connections.insert(cluster.clone(), conn);
        }

        let transaction = Transaction {
            id,
            clusters: clusters.clone(),
            state: TxState::Prepared,
            connections,
            started_at: Instant::now(),
        };

        self.inner
            .transactions
            .lock()
            .insert(id, Arc::new(AsyncMutex::new(transaction)));

        debug!("transaction started across {:?} [{}]", clusters, id);
        self.inner.events.emit(Event::TransactionStarted {
            id: id.to_string(),
            clusters,
        });

        Ok(id)
    }

    async fn abort_begun(&self, connections: &mut FnvHashMap<String, Guard>) {
        for (cluster, conn) in connections.iter_mut() {
            if let Err(err) = conn.execute("ROLLBACK", &[]).await {
                warn!("rollback failed: {} [{}]", err, cluster);
            }
        }
        connections.clear();
    }

    /// Run a statement inside the transaction, on the cluster the
    /// statement resolves to.
    pub async fn execute(
        &self,
        id: Uuid,
        statement: &TransactionStatement,
    ) -> Result<QueryResult, Error> {
        let transaction = self.transaction(id)?;
        let mut transaction = transaction.lock().await;

        if transaction.state != TxState::Prepared {
            return Err(Error::WrongState(id, transaction.state));
        }

        let cluster = match (&statement.cluster_id, &statement.schema) {
            (Some(cluster), _) => cluster.clone(),
            (None, Some(schema)) => self
                .inner
                .manager
                .schema_cluster(schema)
                .ok_or(Error::NoTarget)?,
            (None, None) => return Err(Error::NoTarget),
        };

        if !transaction.clusters.contains(&cluster) {
            return Err(Error::NotParticipant(cluster));
        }

        let conn = transaction
            .connections
            .get_mut(&cluster)
            .ok_or(Error::NotParticipant(cluster.clone()))?;

        Ok(conn.execute(&statement.sql, &statement.params).await?)
    }

    /// Commit: plain `COMMIT` for one cluster, two-phase for several.
    pub async fn commit(&self, id: Uuid) -> Result<(), Error> {
        let transaction = self.take(id)?;
        let mut transaction = transaction.lock().await;

        if transaction.state != TxState::Prepared {
            return Err(Error::WrongState(id, transaction.state));
        }

        transaction.state = TxState::Committing;
        let duration = transaction.started_at.elapsed();

        if transaction.clusters.len() == 1 {
            let cluster = transaction.clusters[0].clone();
            let conn = transaction
                .connections
                .get_mut(&cluster)
                .ok_or_else(|| Error::NotParticipant(cluster.clone()))?;

            match conn.execute("COMMIT", &[]).await {
                Ok(_) => {
                    transaction.state = TxState::Committed;
                    self.finish(duration, true);
                    self.inner.events.emit(Event::TransactionCommitted {
                        id: id.to_string(),
                        duration,
                    });
                    return Ok(());
                }
                Err(err) => {
                    let _ = conn.execute("ROLLBACK", &[]).await;
                    transaction.state = TxState::Aborted;
                    self.finish(duration, false);
                    self.inner.events.emit(Event::TransactionAborted {
                        id: id.to_string(),
                    });
                    return Err(err.into());
                }
            }
        }

        let name = transaction.prepared_name();
        let clusters = transaction.clusters.clone();

        // Phase 1: prepare everywhere.
        let mut prepared: Vec<String> = vec![];
        for cluster in &clusters {
            let conn = transaction.connections.get_mut(cluster).unwrap();
            match conn
                .execute(&format!("PREPARE TRANSACTION '{}'", name), &[])
                .await
            {
                Ok(_) => prepared.push(cluster.clone()),
                Err(err) => {
                    // Undo the participants that prepared, roll back the rest.
                    for other in &clusters {
                        let conn = transaction.connections.get_mut(other).unwrap();
                        let result = if prepared.contains(other) {
                            conn.execute(&format!("ROLLBACK PREPARED '{}'", name), &[])
                                .await
                        } else {
                            conn.execute("ROLLBACK", &[]).await
                        };
                        if let Err(err) = result {
                            warn!("rollback failed: {} [{}]", err, other);
                        }
                    }

                    transaction.state = TxState::Aborted;
                    self.finish(duration, false);
                    self.inner.events.emit(Event::TransactionAborted {
                        id: id.to_string(),
                    });
                    return Err(Error::PreparePhaseFailed(cluster.clone(), err.to_string()));
                }
            }
        }

        // Phase 2: commit everywhere. Partial failures leave the
        // transaction in doubt; they are logged, not retried.
        let mut failed: Vec<String> = vec![];
        for cluster in &clusters {
            let conn = transaction.connections.get_mut(cluster).unwrap();
            if let Err(err) = conn
                .execute(&format!("COMMIT PREPARED '{}'", name), &[])
                .await
            {
                warn!(
                    "commit prepared '{}' failed, operator recovery required: {} [{}]",
                    name, err, cluster
                );
                failed.push(cluster.clone());
            }
        }

        transaction.state = TxState::Committed;
        self.finish(duration, true);

        if failed.is_empty() {
            self.inner.events.emit(Event::TransactionCommitted {
                id: id.to_string(),
                duration,
            });
            Ok(())
        } else {
            self.inner.events.emit(Event::Error {
                message: format!("transaction '{}' in doubt on {:?}", name, failed),
            });
            Err(Error::CommitPhaseFailed(failed))
        }
    }

    /// Roll back on every participant.
    pub async fn rollback(&self, id: Uuid) -> Result<(), Error> {
        let transaction = self.take(id)?;
        let mut transaction = transaction.lock().await;

        transaction.state = TxState::Aborting;
        let duration = transaction.started_at.elapsed();

        for cluster in transaction.clusters.clone() {
            if let Some(conn) = transaction.connections.get_mut(&cluster) {
                if let Err(err) = conn.execute("ROLLBACK", &[]).await {
                    warn!("rollback failed: {} [{}]", err, cluster);
                }
            }
        }

        transaction.state = TxState::Aborted;
        self.finish(duration, false);
        self.inner.events.emit(Event::TransactionAborted {
            id: id.to_string(),
        });

        Ok(())
    }

    pub fn metrics(&self) -> TransactionMetrics {
        *self.inner.metrics.lock()
    }

    pub fn active_transactions(&self) -> usize {
        self.inner.transactions.lock().len()
    }

    /// Roll back everything still open.
    pub async fn close(&self) {
        let ids: Vec<Uuid> = self.inner.transactions.lock().keys().copied().collect();

        for id in ids {
            if let Err(err) = self.rollback(id).await {
                warn!("rollback on close failed: {} [{}]", err, id);
            }
        }
    }

    fn transaction(&self, id: Uuid) -> Result<Arc<AsyncMutex<Transaction>>, Error> {
        self.inner
            .transactions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    fn take(&self, id: Uuid) -> Result<Arc<AsyncMutex<Transaction>>, Error> {
        self.inner
            .transactions
            .lock()
            .remove(&id)
            .ok_or(Error::NotFound(id))
    }

    fn finish(&self, duration: Duration, committed: bool) {
        self.inner.metrics.lock().finish(duration, committed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::manager::test::manager;
    use crate::backend::mock::MockDriver;
    use crate::events;

    async fn engine(driver: &MockDriver) -> TransactionManager {
        let manager = manager(driver).await;
        let events = manager.events().clone();
        TransactionManager::new(manager, events)
    }

    fn statements(driver: &MockDriver, host: &str) -> Vec<String> {
        driver.executed_on(host)
    }

    #[tokio::test]
    async fn test_two_phase_commit_happy_path() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;
        let mut rx = engine.inner.events.subscribe();

        let id = engine
            .begin(
                &["users".into(), "orders".into()],
                &TransactionOptions::default(),
            )
            .await
            .unwrap();

        engine
            .execute(id, &TransactionStatement::on_schema("INSERT INTO u VALUES (1)", "users"))
            .await
            .unwrap();
        engine
            .execute(id, &TransactionStatement::on_schema("INSERT INTO o VALUES (1)", "orders"))
            .await
            .unwrap();

        engine.commit(id).await.unwrap();

        for host in ["primary-a", "primary-b"] {
            let seen = statements(&driver, host);
            assert_eq!(seen[0], "BEGIN");
            assert!(seen[1].starts_with("INSERT"));
            assert!(seen[2].starts_with("PREPARE TRANSACTION 'pgm_"));
            assert!(seen[3].starts_with("COMMIT PREPARED 'pgm_"));
        }

        let kinds: Vec<&str> = events::drain(&mut rx)
            .iter()
            .map(|e| e.kind())
            .filter(|k| k.starts_with("transaction"))
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["transactionStarted", "transactionCommitted"]);

        let metrics = engine.metrics();
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.committed, 1);
        assert_eq!(metrics.distributed, 1);
        assert_eq!(metrics.active, 0);
        assert_eq!(engine.active_transactions(), 0);
    }

    #[tokio::test]
    async fn test_prepare_failure_rolls_back_all() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;
        let mut rx = engine.inner.events.subscribe();

        driver.fail_sql("primary-b", "PREPARE TRANSACTION");

        let id = engine
            .begin(
                &["users".into(), "orders".into()],
                &TransactionOptions::default(),
            )
            .await
            .unwrap();

        let err = engine.commit(id).await.unwrap_err();
        assert!(matches!(err, Error::PreparePhaseFailed(ref cluster, _) if cluster == "b"));

        // The prepared participant gets ROLLBACK PREPARED, the failed
        // one a plain ROLLBACK.
        let a = statements(&driver, "primary-a");
        assert!(a.iter().any(|sql| sql.starts_with("ROLLBACK PREPARED 'pgm_")));
        let b = statements(&driver, "primary-b");
        assert_eq!(b.last().unwrap(), "ROLLBACK");

        let kinds: Vec<&str> = events::drain(&mut rx)
            .iter()
            .map(|e| e.kind())
            .filter(|k| k.starts_with("transaction"))
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["transactionStarted", "transactionAborted"]);

        let metrics = engine.metrics();
        assert_eq!(metrics.aborted, 1);
        assert_eq!(metrics.committed, 0);
    }

    #[tokio::test]
    async fn test_commit_prepared_partial_failure_is_in_doubt() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        driver.fail_sql("primary-b", "COMMIT PREPARED");

        let id = engine
            .begin(
                &["users".into(), "orders".into()],
                &TransactionOptions::default(),
            )
            .await
            .unwrap();

        let err = engine.commit(id).await.unwrap_err();
        match err {
            Error::CommitPhaseFailed(failed) => assert_eq!(failed, vec!["b".to_string()]),
            other => panic!("unexpected error: {}", other),
        }

        // The committed participant stays committed; nothing rolled back.
        let a = statements(&driver, "primary-a");
        assert!(a.last().unwrap().starts_with("COMMIT PREPARED"));
    }

    #[tokio::test]
    async fn test_single_cluster_commits_plainly() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        let id = engine
            .begin(&["users".into()], &TransactionOptions::default())
            .await
            .unwrap();
        engine
            .execute(id, &TransactionStatement::on_schema("INSERT INTO u VALUES (1)", "users"))
            .await
            .unwrap();
        engine.commit(id).await.unwrap();

        let seen = statements(&driver, "primary-a");
        assert_eq!(seen, vec!["BEGIN", "INSERT INTO u VALUES (1)", "COMMIT"]);
        assert_eq!(engine.metrics().distributed, 0);
    }

    #[tokio::test]
    async fn test_begin_failure_rolls_back_begun() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        driver.fail_sql("primary-b", "BEGIN");

        let err = engine
            .begin(
                &["users".into(), "orders".into()],
                &TransactionOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pool(_)));

        let a = statements(&driver, "primary-a");
        assert_eq!(a, vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(engine.metrics().aborted, 1);
    }

    #[tokio::test]
    async fn test_rollback() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        let id = engine
            .begin(
                &["users".into(), "orders".into()],
                &TransactionOptions::default(),
            )
            .await
            .unwrap();
        engine.rollback(id).await.unwrap();

        for host in ["primary-a", "primary-b"] {
            assert_eq!(statements(&driver, host), vec!["BEGIN", "ROLLBACK"]);
        }

        // The transaction is gone.
        let err = engine.commit(id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_execute_errors() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        let id = engine
            .begin(&["users".into()], &TransactionOptions::default())
            .await
            .unwrap();

        // Statement with no target.
        let err = engine
            .execute(id, &TransactionStatement::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoTarget));

        // Statement resolving outside the transaction.
        let err = engine
            .execute(id, &TransactionStatement::on_schema("SELECT 1", "orders"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotParticipant(_)));

        engine.commit(id).await.unwrap();

        let err = engine
            .execute(id, &TransactionStatement::on_schema("SELECT 1", "users"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_schema_on_begin() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        let err = engine
            .begin(&["ghost".into()], &TransactionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Manager(_)));
        assert_eq!(engine.metrics().total, 0);
    }

    #[tokio::test]
    async fn test_close_rolls_back_active() {
        crate::logger();
        let driver = MockDriver::new();
        let engine = engine(&driver).await;

        engine
            .begin(&["users".into()], &TransactionOptions::default())
            .await
            .unwrap();
        engine
            .begin(&["orders".into()], &TransactionOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.active_transactions(), 2);

        engine.close().await;
        assert_eq!(engine.active_transactions(), 0);
        assert_eq!(engine.metrics().aborted, 2);
    }
}
