use serde::{Deserialize, Serialize};

/// Cache backend statistics.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub sets: usize,
    pub deletes: usize,
    pub evictions: usize,
    /// Entries currently stored.
    pub entries: usize,
    /// Estimated size of stored values, in bytes.
    pub size_bytes: usize,
}

impl CacheStats {
    /// Hit rate in percent.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.hits = 3;
        stats.misses = 1;
        assert_eq!(stats.hit_rate(), 75.0);
    }
}
