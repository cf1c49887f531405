use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Cumulative pool counters.
///
/// These are updated on every acquire/release.
///
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counts {
    /// Number of server connections the pool opened.
    pub created: usize,
    /// Number of server connections the pool closed.
    pub destroyed: usize,
    /// How many times a connection has been given to a caller.
    pub acquired: usize,
    /// How many times a connection has been returned to the pool.
    pub released: usize,
}

impl Sub for Counts {
    type Output = Counts;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            created: self.created.saturating_sub(rhs.created),
            destroyed: self.destroyed.saturating_sub(rhs.destroyed),
            acquired: self.acquired.saturating_sub(rhs.acquired),
            released: self.released.saturating_sub(rhs.released),
        }
    }
}

impl Add for Counts {
    type Output = Counts;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            created: self.created.saturating_add(rhs.created),
            destroyed: self.destroyed.saturating_add(rhs.destroyed),
            acquired: self.acquired.saturating_add(rhs.acquired),
            released: self.released.saturating_add(rhs.released),
        }
    }
}

/// Instantaneous connection counts reported by the driver.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStatus {
    /// Total number of connections managed by the driver pool.
    pub total: usize,
    /// Number of idle connections.
    pub idle: usize,
    /// Number of callers waiting for a connection.
    pub waiting: usize,
}

impl PoolStatus {
    /// Connections currently handed out.
    pub fn active(&self) -> usize {
        self.total.saturating_sub(self.idle)
    }
}

/// Merged pool metrics: cumulative counters plus a driver snapshot.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolMetrics {
    pub created: usize,
    pub destroyed: usize,
    pub acquired: usize,
    pub released: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub total: usize,
}

impl PoolMetrics {
    pub fn merge(counts: Counts, status: PoolStatus) -> Self {
        Self {
            created: counts.created,
            destroyed: counts.destroyed,
            acquired: counts.acquired,
            released: counts.released,
            active: status.active(),
            idle: status.idle,
            waiting: status.waiting,
            total: status.total,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counts_arithmetic() {
        let a = Counts {
            created: 10,
            destroyed: 2,
            acquired: 50,
            released: 48,
        };
        let b = Counts {
            created: 4,
            destroyed: 1,
            acquired: 20,
            released: 20,
        };

        let sum = a + b;
        assert_eq!(sum.created, 14);
        assert_eq!(sum.acquired, 70);

        let diff = a - b;
        assert_eq!(diff.destroyed, 1);
        assert_eq!(diff.released, 28);

        // Saturating, never wraps.
        let diff = b - a;
        assert_eq!(diff.created, 0);
        assert_eq!(diff.acquired, 0);
    }

    #[test]
    fn test_merge() {
        let counts = Counts {
            created: 5,
            destroyed: 0,
            acquired: 12,
            released: 10,
        };
        let status = PoolStatus {
            total: 5,
            idle: 3,
            waiting: 1,
        };

        let metrics = PoolMetrics::merge(counts, status);
        assert_eq!(metrics.active, 2);
        assert_eq!(metrics.active + metrics.idle, metrics.total);
        assert_eq!(metrics.waiting, 1);
    }
}
