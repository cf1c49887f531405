use thiserror::Error;
use uuid::Uuid;

use crate::backend::{manager, pool};

use super::TxState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transaction not found: {0}")]
    NotFound(Uuid),

    #[error("transaction {0} is {1}, expected prepared")]
    WrongState(Uuid, TxState),

    #[error("no target schemas")]
    NoSchemas,

    #[error("statement targets no known cluster")]
    NoTarget,

    #[error("cluster \"{0}\" is not part of the transaction")]
    NotParticipant(String),

    #[error("prepare failed on \"{0}\": {1}")]
    PreparePhaseFailed(String, String),

    #[error("commit prepared failed on {0:?}; transaction in doubt")]
    CommitPhaseFailed(Vec<String>),

    #[error("transaction timed out")]
    Timeout,

    #[error("{0}")]
    Manager(#[from] manager::Error),

    #[error("{0}")]
    Pool(#[from] pool::Error),
}
