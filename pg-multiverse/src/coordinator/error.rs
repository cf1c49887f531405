use thiserror::Error;

use crate::backend::{manager, pool};
use crate::{cache, config, migrate, transaction};

#[derive(Debug, Error)]
pub enum Error {
    #[error("coordinator not initialized")]
    NotInitialized,

    #[error("configuration invalid: {0:?}")]
    ConfigInvalid(Vec<String>),

    #[error("{0}")]
    Config(#[from] config::Error),

    #[error("{0}")]
    Manager(#[from] manager::Error),

    #[error("{0}")]
    Pool(#[from] pool::Error),

    #[error("{0}")]
    Cache(#[from] cache::Error),

    #[error("{0}")]
    Transaction(#[from] transaction::Error),

    #[error("{0}")]
    Migration(#[from] migrate::Error),

    #[error("{0}")]
    Serialization(#[from] serde_json::Error),
}
