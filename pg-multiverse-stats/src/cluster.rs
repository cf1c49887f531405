use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-cluster query accounting.
///
/// `avg_response_time` is a biased moving average, `(old + sample) / 2`.
/// The `response_time` load balancing strategy is tuned against it, so the
/// bias is part of the contract.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClusterStats {
    /// Total queries executed against the cluster.
    pub queries: usize,
    /// Queries that returned an error.
    pub errors: usize,
    /// Moving average of query duration.
    pub avg_response_time: Duration,
    /// Connections currently checked out for this cluster.
    pub connections: usize,
}

impl ClusterStats {
    /// Fold one query sample into the stats.
    pub fn record(&mut self, duration: Duration, ok: bool) {
        self.queries += 1;
        if !ok {
            self.errors += 1;
        }
        self.avg_response_time = if self.avg_response_time.is_zero() {
            duration
        } else {
            (self.avg_response_time + duration) / 2
        };
    }

    /// Error rate in percent.
    pub fn error_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.errors as f64 / self.queries as f64 * 100.0
        }
    }
}
