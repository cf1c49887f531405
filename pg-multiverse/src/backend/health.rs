//! Cluster health monitoring.
//!
//! A periodic task probes every pool of every registered cluster with
//! `SELECT 1` and tracks up/down/recovered transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use pg_multiverse_stats::{ClusterHealth, HealthConnections, HealthQueries};
use tokio::time::{sleep, Instant};
use tokio::{select, spawn, sync::Notify};
use tracing::{debug, error, info};

use crate::events::{Event, Events};

use super::cluster::{Cluster, ClusterStatus};
use super::manager::Registry;

/// Default probe interval.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

struct Tracked {
    health: ClusterHealth,
    healthy_since: Option<Instant>,
}

struct HealthInner {
    interval: Duration,
    registry: Registry,
    events: Events,
    tracked: Mutex<FnvHashMap<String, Tracked>>,
    shutdown: Notify,
    running: AtomicBool,
}

/// Health checker handle. Cheap to clone.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<HealthInner>,
}

impl HealthChecker {
    pub fn new(registry: Registry, events: Events, interval: Duration) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                interval,
                registry,
                events,
                tracked: Mutex::new(FnvHashMap::default()),
                shutdown: Notify::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Start the periodic task. The first sweep runs immediately.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let checker = self.clone();
        spawn(async move {
            debug!("health checker started");

            loop {
                checker.sweep().await;

                select! {
                    _ = sleep(checker.inner.interval) => (),
                    _ = checker.inner.shutdown.notified() => break,
                }

                if !checker.inner.running.load(Ordering::SeqCst) {
                    break;
                }
            }

            debug!("health checker stopped");
        });
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    async fn sweep(&self) {
        let clusters: Vec<Cluster> = self.inner.registry.read().values().cloned().collect();

        for cluster in clusters {
            self.check_cluster(&cluster).await;
        }
    }

    /// Probe one cluster now.
    pub async fn force_check(&self, cluster_id: &str) -> Option<ClusterHealth> {
        let cluster = self.inner.registry.read().get(cluster_id).cloned()?;
        Some(self.check_cluster(&cluster).await)
    }

    async fn check_cluster(&self, cluster: &Cluster) -> ClusterHealth {
        let started = Instant::now();
        let mut probe_error = None;

        // Primary and every replica: acquire, SELECT 1, release.
        for pool in cluster.all_pools() {
            if let Err(err) = pool.query("SELECT 1", &[]).await {
                probe_error = Some(format!("{} [{}]", err, pool.id()));
                break;
            }
        }

        let response_time = started.elapsed();
        let healthy = probe_error.is_none();

        let mut connections = HealthConnections::default();
        for pool in cluster.all_pools() {
            let metrics = pool.metrics();
            connections.active += metrics.active;
            connections.idle += metrics.idle;
            connections.total += metrics.total;
        }

        let stats = cluster.stats();
        let queries = HealthQueries {
            total: stats.queries,
            successful: stats.queries.saturating_sub(stats.errors),
            failed: stats.errors,
            avg_response_time: stats.avg_response_time,
        };

        let mut tracked = self.inner.tracked.lock();
        let previous = tracked.get(cluster.id());

        let was_healthy = previous.map(|t| t.health.healthy);
        let previous_last_check = previous.map(|t| t.health.last_check);
        let failure_count = if healthy {
            0
        } else {
            previous.map(|t| t.health.failure_count).unwrap_or(0) + 1
        };
        let healthy_since = if healthy {
            previous
                .and_then(|t| t.healthy_since)
                .or(Some(Instant::now()))
        } else {
            None
        };

        let health = ClusterHealth {
            cluster_id: cluster.id().to_string(),
            healthy,
            last_check: Utc::now(),
            response_time,
            failure_count,
            uptime: healthy_since
                .map(|since| since.elapsed())
                .unwrap_or(Duration::ZERO),
            connections,
            queries,
            error: probe_error.clone(),
        };

        tracked.insert(
            cluster.id().to_string(),
            Tracked {
                health: health.clone(),
                healthy_since,
            },
        );
        drop(tracked);

        match (was_healthy, healthy) {
            // Transition to unhealthy, or first observation of a dead cluster.
            (Some(true), false) | (None, false) => {
                let reason = probe_error.unwrap_or_else(|| "probe failed".into());
                error!("cluster down: {} [{}]", reason, cluster.id());
                cluster.set_status(ClusterStatus::Down);
                self.inner.events.emit(Event::ClusterDown {
                    cluster_id: cluster.id().to_string(),
                    reason,
                });
            }
            // Recovery.
            (Some(false), true) => {
                let downtime = previous_last_check
                    .map(|last| {
                        (Utc::now() - last)
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                    })
                    .unwrap_or(Duration::ZERO);
                info!("cluster recovered after {:?} [{}]", downtime, cluster.id());
                cluster.set_status(ClusterStatus::Active);
                self.inner.events.emit(Event::ClusterRecovered {
                    cluster_id: cluster.id().to_string(),
                    downtime,
                });
                self.inner.events.emit(Event::ClusterUp {
                    cluster_id: cluster.id().to_string(),
                });
            }
            _ => (),
        }

        health
    }

    pub fn get_health(&self, cluster_id: &str) -> Option<ClusterHealth> {
        self.inner
            .tracked
            .lock()
            .get(cluster_id)
            .map(|t| t.health.clone())
    }

    pub fn all_health(&self) -> FnvHashMap<String, ClusterHealth> {
        self.inner
            .tracked
            .lock()
            .iter()
            .map(|(id, t)| (id.clone(), t.health.clone()))
            .collect()
    }

    pub fn remove_cluster(&self, cluster_id: &str) {
        self.inner.tracked.lock().remove(cluster_id);
    }
}
