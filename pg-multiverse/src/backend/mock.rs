//! Scripted driver used by tests.
//!
//! Connections are identified by the host they were opened against, so
//! tests name their servers (`primary-a`, `replica-a-0`) and assert on the
//! statements each one saw.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use pg_multiverse_config::ConnectionConfig;
use pg_multiverse_stats::PoolStatus;
use serde_json::{json, Value};

use super::driver::{Driver, DriverError, QueryResult, Server, ServerPool};

#[derive(Default)]
struct MockState {
    /// Every executed statement, in global order.
    log: Mutex<Vec<(String, String)>>,
    /// Hosts whose connections fail to acquire or execute.
    down: Mutex<HashSet<String>>,
    /// Hosts that refuse `connect`.
    fail_connect: Mutex<HashSet<String>>,
    /// (host, sql prefix) pairs that error on execute.
    fail_sql: Mutex<Vec<(String, String)>>,
    /// sql prefix → scripted result.
    responses: Mutex<Vec<(String, QueryResult)>>,
    /// Checked-out connections per host.
    active: Mutex<FnvHashMap<String, usize>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.state.log.lock().clone()
    }

    pub fn executed_on(&self, host: &str) -> Vec<String> {
        self.state
            .log
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }

    /// Make every connection to the host fail, or recover it.
    pub fn set_down(&self, host: &str, down: bool) {
        let mut hosts = self.state.down.lock();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    /// Refuse `connect` for the host.
    pub fn fail_connect(&self, host: &str) {
        self.state.fail_connect.lock().insert(host.to_string());
    }

    /// Error any statement on the host starting with the prefix.
    pub fn fail_sql(&self, host: &str, prefix: &str) {
        self.state
            .fail_sql
            .lock()
            .push((host.to_string(), prefix.to_string()));
    }

    /// Script the result for statements starting with the prefix.
    pub fn respond(&self, prefix: &str, result: QueryResult) {
        self.state
            .responses
            .lock()
            .push((prefix.to_string(), result));
    }

    pub fn active(&self, host: &str) -> usize {
        *self.state.active.lock().get(host).unwrap_or(&0)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(
        &self,
        options: &ConnectionConfig,
    ) -> Result<Box<dyn ServerPool>, DriverError> {
        if self.state.fail_connect.lock().contains(&options.host) {
            return Err(DriverError::new(format!(
                "connection refused [{}]",
                options.host
            )));
        }

        Ok(Box::new(MockPool {
            host: options.host.clone(),
            state: self.state.clone(),
        }))
    }
}

struct MockPool {
    host: String,
    state: Arc<MockState>,
}

#[async_trait]
impl ServerPool for MockPool {
    async fn acquire(&self) -> Result<Box<dyn Server>, DriverError> {
        if self.state.down.lock().contains(&self.host) {
            return Err(DriverError::new(format!("server down [{}]", self.host)));
        }

        *self.state.active.lock().entry(self.host.clone()).or_default() += 1;

        Ok(Box::new(MockConn {
            host: self.host.clone(),
            state: self.state.clone(),
        }))
    }

    fn status(&self) -> PoolStatus {
        let active = *self.state.active.lock().get(&self.host).unwrap_or(&0);

        PoolStatus {
            total: active,
            idle: 0,
            waiting: 0,
        }
    }

    async fn close(&self) {}
}

struct MockConn {
    host: String,
    state: Arc<MockState>,
}

#[async_trait]
impl Server for MockConn {
    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<QueryResult, DriverError> {
        if self.state.down.lock().contains(&self.host) {
            return Err(DriverError::new(format!("server down [{}]", self.host)));
        }

        let failure = self
            .state
            .fail_sql
            .lock()
            .iter()
            .any(|(host, prefix)| *host == self.host && sql.starts_with(prefix.as_str()));
        if failure {
            self.state
                .log
                .lock()
                .push((self.host.clone(), sql.to_string()));
            return Err(DriverError::new(format!(
                "statement failed: {} [{}]",
                sql, self.host
            )));
        }

        self.state
            .log
            .lock()
            .push((self.host.clone(), sql.to_string()));

        let scripted = self
            .state
            .responses
            .lock()
            .iter()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone());

        if let Some(result) = scripted {
            return Ok(result);
        }

        if sql.starts_with("SELECT 1") {
            return Ok(QueryResult {
                columns: vec!["?column?".into()],
                rows: vec![vec![json!(1)]],
                rows_affected: 0,
            });
        }

        Ok(QueryResult {
            rows_affected: 1,
            ..Default::default()
        })
    }
}

impl Drop for MockConn {
    fn drop(&mut self) {
        let mut active = self.state.active.lock();
        if let Some(count) = active.get_mut(&self.host) {
            *count = count.saturating_sub(1);
        }
    }
}
