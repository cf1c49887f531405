//! Pool configuration.

use std::time::Duration;

use pg_multiverse_config::{ConnectionConfig, PoolOptions};

/// Settings for one pool: the server it connects to and the pool limits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub options: PoolOptions,
}

impl Config {
    pub fn new(connection: ConnectionConfig, options: PoolOptions) -> Self {
        Self {
            connection,
            options,
        }
    }

    /// How long `acquire` waits for readiness or a free connection.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.options.acquire_timeout_millis)
    }
}
