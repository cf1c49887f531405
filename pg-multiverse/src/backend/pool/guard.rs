//! Connection guard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::time::Instant;

use crate::backend::driver::{QueryResult, Server};
use crate::events::Event;

use super::{Error, Pool};

/// Routing metadata that travels with a checked-out connection, so work
/// can be attributed without re-routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub cluster_id: String,
    pub schema: Option<String>,
    pub pool_id: String,
}

/// A connection checked out of a pool. Dropping it releases the
/// connection back to the driver and records the release.
pub struct Guard {
    server: Option<Box<dyn Server>>,
    pool: Pool,
    metadata: ClusterMetadata,
    tracker: Option<Arc<AtomicUsize>>,
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("pool_id", &self.metadata.pool_id)
            .finish()
    }
}

impl Guard {
    pub(crate) fn new(pool: Pool, server: Box<dyn Server>) -> Self {
        let metadata = ClusterMetadata {
            cluster_id: pool.id().cluster_id.clone(),
            schema: None,
            pool_id: pool.id().to_string(),
        };

        Self {
            server: Some(server),
            pool,
            metadata,
            tracker: None,
        }
    }

    /// Run one statement on this connection. Folds the duration into the
    /// pool's response time average.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult, Error> {
        let server = self
            .server
            .as_mut()
            .ok_or_else(|| Error::Offline(self.metadata.pool_id.clone()))?;

        let started = Instant::now();
        let result = server.execute(sql, params).await;
        self.pool.record_response_time(started.elapsed());

        Ok(result?)
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    pub(crate) fn set_schema(&mut self, schema: Option<String>) {
        self.metadata.schema = schema;
    }

    /// Attach a checked-out gauge, decremented on release.
    pub(crate) fn track(&mut self, counter: Arc<AtomicUsize>) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.tracker = Some(counter);
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        // The driver reclaims the connection when the box drops.
        self.server.take();

        let inner = self.pool.inner();
        inner.released.fetch_add(1, Ordering::Relaxed);
        inner.events.emit(Event::ConnectionReleased {
            pool_id: self.metadata.pool_id.clone(),
        });

        if let Some(tracker) = self.tracker.take() {
            tracker.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
