//! Connection pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use pg_multiverse_stats::{Counts, PoolMetrics, PoolStatus};
use serde_json::Value;
use tokio::spawn;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::backend::driver::{Driver, QueryResult, ServerPool};
use crate::events::{Event, Events};

use super::{Comms, Config, Error, Guard, PoolId};

/// Connection pool for one server. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<InnerSync>,
}

pub(crate) struct InnerSync {
    pub(super) id: PoolId,
    pub(super) config: Config,
    pub(super) comms: Comms,
    driver: Arc<dyn Driver>,
    server_pool: RwLock<Option<Arc<dyn ServerPool>>>,
    ready: AtomicBool,
    closed: AtomicBool,
    launched: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    acquired: AtomicUsize,
    pub(super) released: AtomicUsize,
    avg_response_time: Mutex<Duration>,
    pub(super) events: Events,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("id", &self.inner.id).finish()
    }
}

/// Snapshot of a pool's identity and state.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub id: String,
    pub cluster_id: String,
    pub role: super::Role,
    pub replica_index: Option<usize>,
    pub ready: bool,
    pub closed: bool,
    pub metrics: PoolMetrics,
}

impl Pool {
    /// Create a new pool. It stays inert until [`launch`](Self::launch).
    pub fn new(id: PoolId, config: Config, driver: Arc<dyn Driver>, events: Events) -> Self {
        Self {
            inner: Arc::new(InnerSync {
                id,
                config,
                comms: Comms::default(),
                driver,
                server_pool: RwLock::new(None),
                ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                launched: AtomicBool::new(false),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                avg_response_time: Mutex::new(Duration::ZERO),
                events,
            }),
        }
    }

    /// Start the initializer. Construction never blocks; callers wait on
    /// readiness through `acquire` or [`wait_ready`](Self::wait_ready).
    pub fn launch(&self) {
        if self.inner.launched.swap(true, Ordering::SeqCst) {
            return;
        }

        let pool = self.clone();
        spawn(async move {
            pool.initialize().await;
        });
    }

    async fn initialize(&self) {
        match self.inner.driver.connect(&self.inner.config.connection).await {
            Ok(server_pool) => {
                *self.inner.server_pool.write() = Some(Arc::from(server_pool));
                self.inner.created.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.init_failed(err.to_string());
                return;
            }
        };

        // One probe before going ready.
        if let Err(err) = self.probe().await {
            self.init_failed(err.to_string());
            return;
        }

        if self.inner.config.options.warmup_connections {
            if let Err(err) = self.warmup().await {
                self.init_failed(err.to_string());
                return;
            }
        }

        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.comms.notify();
        self.inner.events.emit(Event::PoolReady {
            pool_id: self.id().to_string(),
        });
        info!("pool ready [{}]", self.id());
    }

    fn init_failed(&self, message: String) {
        error!("pool initialization failed: {} [{}]", message, self.id());
        *self.inner.comms.init_error.lock() = Some(message.clone());
        self.inner.comms.notify();
        self.inner.events.emit(Event::Error { message });
    }

    async fn probe(&self) -> Result<(), Error> {
        let server_pool = self.server_pool().ok_or_else(|| self.offline())?;
        let mut conn = server_pool.acquire().await?;
        conn.execute("SELECT 1", &[]).await?;

        Ok(())
    }

    /// Open `min` connections and return them to the driver right away.
    pub async fn warmup(&self) -> Result<(), Error> {
        let server_pool = self.server_pool().ok_or_else(|| self.offline())?;
        let mut conns = vec![];

        for _ in 0..self.inner.config.options.min {
            conns.push(server_pool.acquire().await?);
        }

        debug!("warmed up {} connections [{}]", conns.len(), self.id());

        Ok(())
    }

    /// Get a connection from the pool. Fails immediately when the pool is
    /// closed; blocks up to the acquire timeout while the pool warms up.
    pub async fn acquire(&self) -> Result<Guard, Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(self.offline());
        }

        match timeout(self.inner.config.acquire_timeout(), self.acquire_internal()).await {
            Ok(result) => result,
            Err(_) => Err(Error::CheckoutTimeout(
                self.id().to_string(),
                self.inner.config.acquire_timeout(),
            )),
        }
    }

    async fn acquire_internal(&self) -> Result<Guard, Error> {
        self.ready_internal().await?;

        let server_pool = self.server_pool().ok_or_else(|| self.offline())?;
        let server = server_pool.acquire().await?;
        self.inner.acquired.fetch_add(1, Ordering::Relaxed);

        Ok(Guard::new(self.clone(), server))
    }

    /// Wait until the initializer finished, up to the timeout. Propagates
    /// the initializer's failure.
    pub async fn wait_ready(&self, wait: Duration) -> Result<(), Error> {
        match timeout(wait, self.ready_internal()).await {
            Ok(result) => result,
            Err(_) => Err(Error::CheckoutTimeout(self.id().to_string(), wait)),
        }
    }

    async fn ready_internal(&self) -> Result<(), Error> {
        let mut changed = self.inner.comms.changed.subscribe();

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(self.offline());
            }
            if let Some(message) = self.inner.comms.init_error.lock().clone() {
                return Err(Error::InitFailed(self.id().to_string(), message));
            }
            if self.inner.ready.load(Ordering::SeqCst) {
                return Ok(());
            }

            if changed.changed().await.is_err() {
                return Err(self.offline());
            }
        }
    }

    /// Acquire, run one statement, release.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, Error> {
        let mut conn = self.acquire().await?;
        conn.execute(sql, params).await
    }

    /// The pool can reach its server.
    pub async fn test_connection(&self) -> bool {
        self.query("SELECT 1", &[]).await.is_ok()
    }

    /// Fold a query duration into the pool's moving average.
    pub(crate) fn record_response_time(&self, duration: Duration) {
        let mut avg = self.inner.avg_response_time.lock();
        *avg = if avg.is_zero() {
            duration
        } else {
            (*avg + duration) / 2
        };
    }

    pub fn avg_response_time(&self) -> Duration {
        *self.inner.avg_response_time.lock()
    }

    /// Merged metrics: wrapper counters plus a driver snapshot.
    pub fn metrics(&self) -> PoolMetrics {
        let counts = Counts {
            created: self.inner.created.load(Ordering::Relaxed),
            destroyed: self.inner.destroyed.load(Ordering::Relaxed),
            acquired: self.inner.acquired.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
        };
        let status = self
            .server_pool()
            .map(|pool| pool.status())
            .unwrap_or(PoolStatus::default());

        PoolMetrics::merge(counts, status)
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            id: self.id().to_string(),
            cluster_id: self.inner.id.cluster_id.clone(),
            role: self.inner.id.role,
            replica_index: self.inner.id.replica_index,
            ready: self.is_ready(),
            closed: self.is_closed(),
            metrics: self.metrics(),
        }
    }

    /// Close the pool. Subsequent `acquire` calls fail.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.comms.notify();

        let server_pool = self.inner.server_pool.write().take();
        if let Some(server_pool) = server_pool {
            self.inner
                .destroyed
                .fetch_add(server_pool.status().total, Ordering::Relaxed);
            server_pool.close().await;
        }

        debug!("pool closed [{}]", self.id());
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Pool identity.
    #[inline]
    pub fn id(&self) -> &PoolId {
        &self.inner.id
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn server_pool(&self) -> Option<Arc<dyn ServerPool>> {
        self.inner.server_pool.read().clone()
    }

    fn offline(&self) -> Error {
        Error::Offline(self.id().to_string())
    }

    pub(crate) fn inner(&self) -> &InnerSync {
        &self.inner
    }

    /// Readiness deadline helper used during cluster registration.
    pub async fn wait_ready_or_close(&self, wait: Duration) -> Result<(), Error> {
        match self.wait_ready(wait).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.close().await;
                Err(err)
            }
        }
    }
}
