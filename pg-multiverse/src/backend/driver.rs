//! Wire-level driver contract.
//!
//! The actual PostgreSQL driver is supplied by the host. Everything in this
//! crate talks to it through these object-safe traits; dropping a
//! [`Server`] returns the connection to the driver's pool.

use async_trait::async_trait;
use pg_multiverse_config::ConnectionConfig;
use pg_multiverse_stats::PoolStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Opaque driver failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    /// SQLSTATE, when the server produced one.
    pub code: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

/// Result of one statement. Serializable so results can be cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// A value by row and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)
    }

    /// First value of the first row.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first()?.first()
    }
}

/// A single server connection.
#[async_trait]
pub trait Server: Send {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, DriverError>;
}

/// The driver's own connection pool for one server.
#[async_trait]
pub trait ServerPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Server>, DriverError>;

    /// Instantaneous connection counts.
    fn status(&self) -> PoolStatus;

    async fn close(&self);
}

/// Driver entry point: open a pool to one server.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, options: &ConnectionConfig)
        -> Result<Box<dyn ServerPool>, DriverError>;
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_accessors() {
        let result = QueryResult {
            columns: vec!["version".into(), "batch".into()],
            rows: vec![
                vec![json!("20240101120000"), json!(1)],
                vec![json!("20240102120000"), json!(2)],
            ],
            rows_affected: 0,
        };

        assert_eq!(result.scalar(), Some(&json!("20240101120000")));
        assert_eq!(result.value(1, "batch"), Some(&json!(2)));
        assert_eq!(result.value(0, "missing"), None);
        assert_eq!(result.value(9, "batch"), None);
    }
}
