//! Configuration loading, saving, and watching.
//!
//! The document types and validation rules live in
//! `pg-multiverse-config`; this module owns the live copy, file I/O,
//! and the change watcher.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use pg_multiverse_config::{Config, Validation};
use thiserror::Error;
use tokio::time::sleep;
use tokio::{select, spawn, sync::Notify};
use tracing::{debug, warn};

use crate::events::{Event, Events};
use crate::util::fnv32;

/// File poll cadence while watching.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("no configuration path")]
    NoPath,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(#[from] pg_multiverse_config::Error),

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("schema \"{0}\" is already mapped to \"{1}\"")]
    SchemaMapped(String, String),
}

struct StoreInner {
    path: Mutex<Option<PathBuf>>,
    current: ArcSwap<Config>,
    events: Events,
    watching: AtomicBool,
    shutdown: Notify,
}

/// Configuration store handle. Cheap to clone.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    pub fn new(path: Option<PathBuf>, events: Events) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: Mutex::new(path),
                current: ArcSwap::from_pointee(Config::default()),
                events,
                watching: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// The live document.
    pub fn get(&self) -> Arc<Config> {
        self.inner.current.load_full()
    }

    /// Install a document assembled in memory.
    pub fn replace(&self, config: Config) {
        self.inner.current.store(Arc::new(config));
    }

    /// Read and install the document from disk.
    pub fn load_config(&self) -> Result<Arc<Config>, Error> {
        let path = self.inner.path.lock().clone().ok_or(Error::NoPath)?;
        let content = std::fs::read_to_string(&path)?;
        let config = Config::from_json(&content)?;

        self.inner.current.store(Arc::new(config));
        debug!("configuration loaded from {}", path.display());

        Ok(self.get())
    }

    /// Write a document to disk and install it.
    pub fn save_config(&self, config: &Config, path: Option<&Path>) -> Result<(), Error> {
        let target = match path {
            Some(path) => path.to_path_buf(),
            None => self.inner.path.lock().clone().ok_or(Error::NoPath)?,
        };

        std::fs::write(&target, config.to_json()?)?;
        self.inner.current.store(Arc::new(config.clone()));

        Ok(())
    }

    pub fn validate(&self) -> Validation {
        self.get().validate()
    }

    /// Add a schema to a cluster's served set.
    pub fn map_schema_to_cluster(&self, schema: &str, cluster_id: &str) -> Result<(), Error> {
        let mut config = (*self.get()).clone();

        if let Some(owner) = config.cluster_for_schema(schema) {
            return Err(Error::SchemaMapped(schema.to_string(), owner.to_string()));
        }

        let cluster = config
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| Error::UnknownCluster(cluster_id.to_string()))?;
        cluster.schemas.push(schema.to_string());

        self.replace(config);

        Ok(())
    }

    pub fn unmap_schema_from_cluster(&self, schema: &str, cluster_id: &str) -> Result<(), Error> {
        let mut config = (*self.get()).clone();

        let cluster = config
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| Error::UnknownCluster(cluster_id.to_string()))?;
        cluster.schemas.retain(|s| s != schema);

        self.replace(config);

        Ok(())
    }

    pub fn get_cluster_for_schema(&self, schema: &str) -> Option<String> {
        self.get().cluster_for_schema(schema).map(|s| s.to_string())
    }

    /// Poll the file for content changes and emit `ConfigChanged`.
    pub fn watch(&self) {
        self.watch_with_interval(POLL_INTERVAL);
    }

    pub(crate) fn watch_with_interval(&self, interval: Duration) {
        if self.inner.path.lock().is_none() {
            return;
        }
        if self.inner.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = self.clone();
        spawn(async move {
            let mut last_hash: Option<u32> = None;

            loop {
                select! {
                    _ = sleep(interval) => (),
                    _ = store.inner.shutdown.notified() => break,
                }

                if !store.inner.watching.load(Ordering::SeqCst) {
                    break;
                }

                let path = match store.inner.path.lock().clone() {
                    Some(path) => path,
                    None => break,
                };

                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!("config watch: {} [{}]", err, path.display());
                        continue;
                    }
                };

                let hash = fnv32(&content);
                let changed = last_hash.map(|last| last != hash).unwrap_or(false);
                last_hash = Some(hash);

                if !changed {
                    continue;
                }

                match Config::from_json(&content) {
                    Ok(config) => {
                        store.replace(config);
                        debug!("configuration changed [{}]", path.display());
                        store.inner.events.emit(Event::ConfigChanged);
                    }
                    Err(err) => {
                        warn!("config watch: invalid document: {}", err);
                    }
                }
            }
        });
    }

    pub fn stop_watching(&self) {
        self.inner.watching.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    pub fn close(&self) {
        self.stop_watching();
    }
}
