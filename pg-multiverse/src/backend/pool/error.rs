use std::time::Duration;

use thiserror::Error;

use crate::backend::driver::DriverError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pool is closed [{0}]")]
    Offline(String),

    #[error("pool not ready within {1:?} [{0}]")]
    CheckoutTimeout(String, Duration),

    #[error("pool initialization failed: {1} [{0}]")]
    InitFailed(String, String),

    #[error("{0}")]
    Driver(#[from] DriverError),
}
