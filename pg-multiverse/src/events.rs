//! Typed events surfaced to callers.
//!
//! Every component reports through the same registry. Payloads are fixed
//! per event kind; fan-out preserves emission order.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

/// Why a cache entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Ttl,
    Size,
    Manual,
}

#[derive(Debug, Clone)]
pub enum Event {
    Initialized,
    Closed,
    Error {
        message: String,
    },

    ClusterRegistered {
        cluster_id: String,
    },
    ClusterDown {
        cluster_id: String,
        reason: String,
    },
    ClusterUp {
        cluster_id: String,
    },
    ClusterRecovered {
        cluster_id: String,
        downtime: Duration,
    },
    Failover {
        cluster_id: String,
        new_primary: String,
        old_primary: String,
    },

    PoolReady {
        pool_id: String,
    },
    ConnectionReleased {
        pool_id: String,
    },

    QueryExecuted {
        sql: String,
        params: Vec<Value>,
        duration: Duration,
        cluster_id: String,
    },
    QueryError {
        sql: String,
        error: String,
        cluster_id: String,
    },

    CacheHit {
        key: String,
    },
    CacheMiss {
        key: String,
    },
    CacheEviction {
        key: String,
        reason: EvictionReason,
    },
    CacheSync,

    TransactionStarted {
        id: String,
        clusters: Vec<String>,
    },
    TransactionCommitted {
        id: String,
        duration: Duration,
    },
    TransactionAborted {
        id: String,
    },

    SchemaRegistered {
        schema: String,
        cluster_id: String,
    },
    ConfigChanged,
    ConfigReloaded,

    MigrationStarted {
        version: String,
        schema: String,
        cluster_id: String,
    },
    MigrationCompleted {
        version: String,
        schema: String,
        cluster_id: String,
        duration: Duration,
    },
    MigrationFailed {
        version: String,
        schema: String,
        cluster_id: String,
        error: String,
    },
    RollbackStarted {
        version: String,
        schema: String,
        cluster_id: String,
    },
    RollbackCompleted {
        version: String,
        schema: String,
        cluster_id: String,
    },
    RollbackFailed {
        version: String,
        schema: String,
        cluster_id: String,
        error: String,
    },
}

impl Event {
    /// Stable name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Initialized => "initialized",
            Event::Closed => "closed",
            Event::Error { .. } => "error",
            Event::ClusterRegistered { .. } => "clusterRegistered",
            Event::ClusterDown { .. } => "clusterDown",
            Event::ClusterUp { .. } => "clusterUp",
            Event::ClusterRecovered { .. } => "clusterRecovered",
            Event::Failover { .. } => "failover",
            Event::PoolReady { .. } => "poolReady",
            Event::ConnectionReleased { .. } => "connectionReleased",
            Event::QueryExecuted { .. } => "queryExecuted",
            Event::QueryError { .. } => "queryError",
            Event::CacheHit { .. } => "cacheHit",
            Event::CacheMiss { .. } => "cacheMiss",
            Event::CacheEviction { .. } => "cacheEviction",
            Event::CacheSync => "cacheSync",
            Event::TransactionStarted { .. } => "transactionStarted",
            Event::TransactionCommitted { .. } => "transactionCommitted",
            Event::TransactionAborted { .. } => "transactionAborted",
            Event::SchemaRegistered { .. } => "schemaRegistered",
            Event::ConfigChanged => "configChanged",
            Event::ConfigReloaded => "configReloaded",
            Event::MigrationStarted { .. } => "migrationStarted",
            Event::MigrationCompleted { .. } => "migrationCompleted",
            Event::MigrationFailed { .. } => "migrationFailed",
            Event::RollbackStarted { .. } => "rollbackStarted",
            Event::RollbackCompleted { .. } => "rollbackCompleted",
            Event::RollbackFailed { .. } => "rollbackFailed",
        }
    }
}

/// Event registry handle. Cheap to clone; all clones share subscribers.
#[derive(Debug, Clone)]
pub struct Events {
    tx: broadcast::Sender<Event>,
}

impl Events {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event. A send without subscribers is not an error.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = vec![];
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
