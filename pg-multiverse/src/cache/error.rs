use thiserror::Error;

use crate::backend::driver::DriverError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis: {0}")]
    Redis(#[from] DriverError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}
