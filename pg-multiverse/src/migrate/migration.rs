//! Migration records and their execution context.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::backend::driver::QueryResult;
use crate::backend::request::{Operation, QueryOptions};
use crate::backend::ClusterManager;
use crate::util::sha256_hex;

use super::Error;

/// Handed to `up`/`down`; queries always target the same (schema, cluster).
pub struct MigrationContext {
    manager: ClusterManager,
    pub schema: String,
    pub cluster: String,
    pub version: String,
}

impl MigrationContext {
    pub(crate) fn new(
        manager: ClusterManager,
        schema: &str,
        cluster: &str,
        version: &str,
    ) -> Self {
        Self {
            manager,
            schema: schema.to_string(),
            cluster: cluster.to_string(),
            version: version.to_string(),
        }
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, Error> {
        let mut options = QueryOptions::cluster(&self.cluster);
        options.schema = Some(self.schema.clone());
        options.operation = Some(Operation::Write);

        Ok(self.manager.execute_query(sql, params, &options).await?)
    }
}

/// Programmatic migration body.
pub type MigrationFn =
    Arc<dyn for<'a> Fn(&'a mut MigrationContext) -> BoxFuture<'a, Result<(), Error>> + Send + Sync>;

#[derive(Clone)]
enum Runner {
    /// Run the source as `;`-separated statements.
    Sql,
    Custom(MigrationFn),
}

/// One direction of a migration. The source string participates in the
/// checksum even for programmatic migrations.
#[derive(Clone)]
pub struct MigrationStep {
    pub source: String,
    runner: Runner,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("source", &self.source)
            .finish()
    }
}

impl MigrationStep {
    pub fn sql(source: &str) -> Self {
        Self {
            source: source.to_string(),
            runner: Runner::Sql,
        }
    }

    pub fn custom(source: &str, f: MigrationFn) -> Self {
        Self {
            source: source.to_string(),
            runner: Runner::Custom(f),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.trim().is_empty()
    }

    pub async fn run(&self, context: &mut MigrationContext) -> Result<(), Error> {
        match &self.runner {
            Runner::Sql => {
                for statement in split_statements(&self.source) {
                    context.query(&statement, &[]).await?;
                }
                Ok(())
            }
            Runner::Custom(f) => f(context).await,
        }
    }
}

/// Split a script on `;`, dropping empty fragments.
fn split_statements(source: &str) -> Vec<String> {
    source
        .split(';')
        .map(|statement| statement.trim())
        .filter(|statement| !statement.is_empty())
        .map(|statement| statement.to_string())
        .collect()
}

/// A versioned migration targeting one or more schemas.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Sortable version string, `YYYYMMDDHHMMSS` for file-based ones.
    pub version: String,
    pub name: String,
    pub description: Option<String>,
    pub target_schemas: Vec<String>,
    /// When set, restricts the clusters the migration runs on.
    pub target_clusters: Option<Vec<String>>,
    pub up: MigrationStep,
    pub down: MigrationStep,
    /// Versions that must run or be applied first.
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Migration {
    /// Fingerprint over both directions, recorded on execution.
    pub fn checksum(&self) -> String {
        sha256_hex(&format!("{}{}", self.up.source, self.down.source))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.version.is_empty() {
            return Err(Error::Invalid("version is required".into()));
        }
        if self.name.is_empty() {
            return Err(Error::Invalid(format!(
                "{}: name is required",
                self.version
            )));
        }
        if self.target_schemas.is_empty() {
            return Err(Error::Invalid(format!(
                "{}: targetSchemas must not be empty",
                self.version
            )));
        }
        if self.up.is_empty() {
            return Err(Error::Invalid(format!("{}: up is required", self.version)));
        }
        if self.down.is_empty() {
            return Err(Error::Invalid(format!(
                "{}: down is required",
                self.version
            )));
        }

        Ok(())
    }

    pub fn targets_schema(&self, schema: &str) -> bool {
        self.target_schemas.iter().any(|s| s == schema)
    }

    pub fn targets_cluster(&self, cluster: &str) -> bool {
        self.target_clusters
            .as_ref()
            .map(|clusters| clusters.iter().any(|c| c == cluster))
            .unwrap_or(true)
    }
}
