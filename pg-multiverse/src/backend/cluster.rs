//! A primary, its replicas, and the schemas they serve.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use pg_multiverse_config::ClusterConfig;
use pg_multiverse_stats::ClusterStats;
use std::time::Duration;
use tracing::warn;

use super::lb::{LoadBalancer, ReplicaSnapshot};
use super::pool::Pool;

/// Lifecycle of a cluster inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Initializing,
    Active,
    Down,
    Maintenance,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Down => "down",
            Self::Maintenance => "maintenance",
        };

        write!(f, "{}", display)
    }
}

struct Pools {
    primary: Pool,
    replicas: Vec<Pool>,
}

struct ClusterInner {
    id: String,
    config: ClusterConfig,
    pools: RwLock<Pools>,
    status: RwLock<ClusterStatus>,
    lb: LoadBalancer,
    stats: Mutex<ClusterStats>,
    /// Connections currently checked out for this cluster.
    connections: Arc<AtomicUsize>,
}

/// Cluster handle. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl Cluster {
    pub fn new(id: &str, config: ClusterConfig, primary: Pool, replicas: Vec<Pool>) -> Self {
        let lb = LoadBalancer::new(config.load_balancing());

        Self {
            inner: Arc::new(ClusterInner {
                id: id.to_string(),
                config,
                pools: RwLock::new(Pools { primary, replicas }),
                status: RwLock::new(ClusterStatus::Initializing),
                lb,
                stats: Mutex::new(ClusterStats::default()),
                connections: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[inline]
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn schemas(&self) -> &[String] {
        &self.inner.config.schemas
    }

    pub fn status(&self) -> ClusterStatus {
        *self.inner.status.read()
    }

    pub fn set_status(&self, status: ClusterStatus) {
        *self.inner.status.write() = status;
    }

    pub fn is_active(&self) -> bool {
        self.status() == ClusterStatus::Active
    }

    pub fn primary(&self) -> Pool {
        self.inner.pools.read().primary.clone()
    }

    pub fn replicas(&self) -> Vec<Pool> {
        self.inner.pools.read().replicas.clone()
    }

    /// Primary first, then replicas in order.
    pub fn all_pools(&self) -> Vec<Pool> {
        let pools = self.inner.pools.read();
        let mut all = vec![pools.primary.clone()];
        all.extend(pools.replicas.iter().cloned());
        all
    }

    pub fn has_replicas(&self) -> bool {
        !self.inner.pools.read().replicas.is_empty()
    }

    /// Selection strategy handle, e.g. to switch strategies at runtime.
    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.inner.lb
    }

    /// Ask the load balancer for a replica pool.
    pub fn select_replica(&self) -> Option<Pool> {
        let replicas = self.replicas();
        if replicas.is_empty() {
            return None;
        }

        let snapshots: Vec<ReplicaSnapshot> = replicas
            .iter()
            .map(|pool| ReplicaSnapshot {
                id: pool.config().connection.host.clone(),
                active: pool.metrics().active,
                avg_response_time: pool.avg_response_time(),
                max_connections: pool
                    .config()
                    .connection
                    .max_connections
                    .unwrap_or(pool.config().options.max),
            })
            .collect();

        match self.inner.lb.select(&snapshots) {
            Ok(index) => replicas.get(index).cloned(),
            Err(err) => {
                warn!("replica selection failed: {} [{}]", err, self.id());
                None
            }
        }
    }

    /// Promote a replica: swap it with the primary. The ex-primary joins
    /// the replica tail. Returns (old primary, new primary) pool ids.
    pub fn failover(&self, replica_index: usize) -> Option<(String, String)> {
        let mut pools = self.inner.pools.write();

        if replica_index >= pools.replicas.len() {
            return None;
        }

        let promoted = pools.replicas.remove(replica_index);
        let demoted = std::mem::replace(&mut pools.primary, promoted);
        let old_primary = demoted.id().to_string();
        pools.replicas.push(demoted);

        Some((old_primary, pools.primary.id().to_string()))
    }

    pub fn record_query(&self, duration: Duration, ok: bool) {
        self.inner.stats.lock().record(duration, ok);
    }

    /// Checked-out gauge, decremented when guards release.
    pub(crate) fn connections_gauge(&self) -> Arc<AtomicUsize> {
        self.inner.connections.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.connections.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ClusterStats {
        let mut stats = *self.inner.stats.lock();
        stats.connections = self.active_connections();
        stats
    }

    pub async fn close(&self) {
        for pool in self.all_pools() {
            pool.close().await;
        }
    }
}
