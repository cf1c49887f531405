use serde::{Deserialize, Serialize};

/// Connection pool settings for one cluster.
///
/// These apply to every pool the cluster creates, primary and replicas.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolOptions {
    /// Minimum connections kept open per pool.
    #[serde(default = "PoolOptions::min")]
    pub min: usize,
    /// Maximum connections per pool.
    #[serde(default = "PoolOptions::max")]
    pub max: usize,
    /// How long `acquire` waits for the pool to become ready or for a free
    /// connection, in milliseconds.
    #[serde(default = "PoolOptions::acquire_timeout_millis")]
    pub acquire_timeout_millis: u64,
    /// Open `min` connections up-front when the pool starts.
    #[serde(default)]
    pub warmup_connections: bool,
}

impl PoolOptions {
    fn min() -> usize {
        1
    }

    fn max() -> usize {
        10
    }

    fn acquire_timeout_millis() -> u64 {
        30_000
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min: Self::min(),
            max: Self::max(),
            acquire_timeout_millis: Self::acquire_timeout_millis(),
            warmup_connections: false,
        }
    }
}
