//! Query routing options.

use std::time::Duration;

use pg_multiverse_config::ConsistencyLevel;

/// Kind of statement, from a leading-keyword sniff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    Read,
    Write,
}

impl Operation {
    /// Detect the operation from the statement's leading keyword.
    /// Anything unrecognized routes as a read.
    pub fn detect(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();

        match keyword.as_str() {
            "insert" | "update" | "delete" | "merge" => Operation::Write,
            _ => Operation::Read,
        }
    }
}

/// Caller-supplied routing and caching options for one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Route by schema through the schema→cluster map.
    pub schema: Option<String>,
    /// Route to a specific cluster, bypassing the schema map.
    pub cluster_id: Option<String>,
    /// Override the detected operation.
    pub operation: Option<Operation>,
    /// Override the cluster's consistency level.
    pub consistency: Option<ConsistencyLevel>,
    /// Serve and store this query through the cache.
    pub cache: bool,
    pub cache_ttl: Option<Duration>,
    pub cache_key: Option<String>,
    pub tags: Vec<String>,
    /// Deadline for the whole operation.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn schema(schema: &str) -> Self {
        Self {
            schema: Some(schema.to_string()),
            ..Default::default()
        }
    }

    pub fn cluster(cluster_id: &str) -> Self {
        Self {
            cluster_id: Some(cluster_id.to_string()),
            ..Default::default()
        }
    }

    pub fn write(mut self) -> Self {
        self.operation = Some(Operation::Write);
        self
    }

    pub fn read(mut self) -> Self {
        self.operation = Some(Operation::Read);
        self
    }

    pub fn consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn cached(mut self, ttl: Option<Duration>) -> Self {
        self.cache = true;
        self.cache_ttl = ttl;
        self
    }

    pub(crate) fn resolved_operation(&self) -> Operation {
        self.operation.unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(Operation::detect("SELECT * FROM users"), Operation::Read);
        assert_eq!(Operation::detect("  with t as (select 1) select *"), Operation::Read);
        assert_eq!(Operation::detect("EXPLAIN SELECT 1"), Operation::Read);
        assert_eq!(Operation::detect("INSERT INTO users VALUES (1)"), Operation::Write);
        assert_eq!(Operation::detect("update users set x = 1"), Operation::Write);
        assert_eq!(Operation::detect("DELETE FROM users"), Operation::Write);
        assert_eq!(Operation::detect("MERGE INTO users"), Operation::Write);
        // Unknown leading keyword routes as a read.
        assert_eq!(Operation::detect("VACUUM"), Operation::Read);
        assert_eq!(Operation::detect(""), Operation::Read);
    }
}
