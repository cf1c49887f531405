use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Distributed transaction engine metrics.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq)]
pub struct TransactionMetrics {
    /// Transactions started.
    pub total: usize,
    /// Transactions currently open.
    pub active: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rolled back.
    pub aborted: usize,
    /// True running mean duration over finished transactions.
    pub avg_duration: Duration,
    /// Transactions that spanned more than one cluster.
    pub distributed: usize,
}

impl TransactionMetrics {
    /// Fold a finished transaction into the running mean.
    pub fn finish(&mut self, duration: Duration, committed: bool) {
        let finished = self.committed + self.aborted;
        self.avg_duration = (self.avg_duration * finished as u32 + duration) / (finished + 1) as u32;
        if committed {
            self.committed += 1;
        } else {
            self.aborted += 1;
        }
        self.active = self.active.saturating_sub(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut metrics = TransactionMetrics {
            total: 3,
            active: 3,
            ..Default::default()
        };

        metrics.finish(Duration::from_millis(100), true);
        assert_eq!(metrics.avg_duration, Duration::from_millis(100));

        metrics.finish(Duration::from_millis(200), true);
        assert_eq!(metrics.avg_duration, Duration::from_millis(150));

        metrics.finish(Duration::from_millis(600), false);
        assert_eq!(metrics.avg_duration, Duration::from_millis(300));

        assert_eq!(metrics.committed, 2);
        assert_eq!(metrics.aborted, 1);
        assert_eq!(metrics.active, 0);
    }
}
