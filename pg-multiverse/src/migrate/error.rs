use thiserror::Error;

use crate::backend::manager;

#[derive(Debug, Error)]
pub enum Error {
    #[error("migration manager not initialized")]
    NotInitialized,

    #[error("invalid migration: {0}")]
    Invalid(String),

    #[error("duplicate migration version: {0}")]
    Duplicate(String),

    #[error("unknown migration version: {0}")]
    UnknownVersion(String),

    #[error("migration \"{0}\" depends on \"{1}\", which is neither planned nor applied")]
    DependencyMissing(String, String),

    #[error("could not acquire migration lock \"{0}\"")]
    LockFailed(String),

    #[error("migration \"{0}\" failed: {1}")]
    ExecutionFailed(String, String),

    #[error("rollback of \"{0}\" failed: {1}")]
    RollbackFailed(String, String),

    #[error("migration file {0}: {1}")]
    Parse(String, String),

    #[error("{0}")]
    Manager(#[from] manager::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}
