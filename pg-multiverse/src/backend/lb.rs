//! Replica selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use thiserror::Error;

use pg_multiverse_config::{LoadBalancingConfig, LoadBalancingStrategy};

/// Score floor below which `health_aware` deprioritizes a replica.
const DEFAULT_HEALTH_THRESHOLD: f64 = 50.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("no replicas to select from")]
    NoReplicas,
}

/// What the selector knows about one replica.
#[derive(Debug, Clone, Default)]
pub struct ReplicaSnapshot {
    pub id: String,
    pub active: usize,
    pub avg_response_time: Duration,
    pub max_connections: usize,
}

/// Per-strategy selection counters.
#[derive(Debug, Clone, Default)]
pub struct LbStats {
    pub total: usize,
    pub by_strategy: FnvHashMap<String, usize>,
}

/// Stateless selector over a replica list, plus a round-robin cursor.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: RwLock<LoadBalancingStrategy>,
    config: LoadBalancingConfig,
    round_robin: AtomicUsize,
    stats: Mutex<LbStats>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancingConfig) -> Self {
        Self {
            strategy: RwLock::new(config.strategy),
            config,
            round_robin: AtomicUsize::new(0),
            stats: Mutex::new(LbStats::default()),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write() = strategy;
    }

    pub fn stats(&self) -> LbStats {
        self.stats.lock().clone()
    }

    /// Pick a replica index.
    pub fn select(&self, replicas: &[ReplicaSnapshot]) -> Result<usize, Error> {
        if replicas.is_empty() {
            return Err(Error::NoReplicas);
        }
        if replicas.len() == 1 {
            return Ok(0);
        }

        let strategy = self.strategy();
        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(replicas),
            LoadBalancingStrategy::Weighted => self.weighted(replicas),
            LoadBalancingStrategy::LeastConnections => Self::least_connections(replicas),
            LoadBalancingStrategy::ResponseTime => Self::response_time(replicas),
            LoadBalancingStrategy::HealthAware => self.health_aware(replicas),
        };

        let mut stats = self.stats.lock();
        stats.total += 1;
        *stats.by_strategy.entry(strategy.to_string()).or_default() += 1;

        Ok(index)
    }

    fn round_robin(&self, replicas: &[ReplicaSnapshot]) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % replicas.len()
    }

    fn weight(&self, replica: &ReplicaSnapshot, index: usize) -> f64 {
        let weights = match &self.config.weights {
            Some(weights) => weights,
            None => return 0.0,
        };

        weights
            .get(&replica.id)
            .or_else(|| weights.get(&format!("replica_{}", index)))
            .copied()
            .unwrap_or(0.0)
    }

    fn weighted(&self, replicas: &[ReplicaSnapshot]) -> usize {
        let total: f64 = replicas
            .iter()
            .enumerate()
            .map(|(i, replica)| self.weight(replica, i))
            .sum();

        // No usable weights, same as round robin.
        if total <= 0.0 {
            return self.round_robin(replicas);
        }

        let mut draw = rand::rng().random_range(0.0..total);
        for (i, replica) in replicas.iter().enumerate() {
            draw -= self.weight(replica, i);
            if draw < 0.0 {
                return i;
            }
        }

        replicas.len() - 1
    }

    fn least_connections(replicas: &[ReplicaSnapshot]) -> usize {
        replicas
            .iter()
            .enumerate()
            .min_by_key(|(index, replica)| (replica.active, *index))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn response_time(replicas: &[ReplicaSnapshot]) -> usize {
        replicas
            .iter()
            .enumerate()
            .min_by_key(|(index, replica)| (replica.avg_response_time, *index))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn health_aware(&self, replicas: &[ReplicaSnapshot]) -> usize {
        let threshold = self.config.health_threshold.unwrap_or(DEFAULT_HEALTH_THRESHOLD);
        let weighted = self.config.weights.is_some();

        let mut best = 0;
        let mut best_score = f64::MIN;

        for (index, replica) in replicas.iter().enumerate() {
            let load = if replica.max_connections > 0 {
                replica.active as f64 / replica.max_connections as f64
            } else {
                0.0
            };
            let latency = (replica.avg_response_time.as_millis() as f64 / 10.0).min(50.0);

            let mut score = 100.0 - load * 30.0 - latency;

            if weighted {
                let weight = self.weight(replica, index);
                if weight > 0.0 {
                    score *= weight;
                }
            }

            if score < threshold {
                score *= 0.1;
            }

            if score > best_score {
                best_score = score;
                best = index;
            }
        }

        best
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pg_multiverse_config::LoadBalancingStrategy::*;
    use std::collections::BTreeMap;

    fn replicas(count: usize) -> Vec<ReplicaSnapshot> {
        (0..count)
            .map(|i| ReplicaSnapshot {
                id: format!("db-{}", i),
                active: 0,
                avg_response_time: Duration::ZERO,
                max_connections: 10,
            })
            .collect()
    }

    fn lb(strategy: pg_multiverse_config::LoadBalancingStrategy) -> LoadBalancer {
        LoadBalancer::new(LoadBalancingConfig {
            strategy,
            ..Default::default()
        })
    }

    #[test]
    fn test_empty_and_single() {
        let lb = lb(RoundRobin);
        assert_eq!(lb.select(&[]), Err(Error::NoReplicas));

        // Single replica skips the strategy entirely.
        assert_eq!(lb.select(&replicas(1)), Ok(0));
        assert_eq!(lb.stats().total, 0);
    }

    #[test]
    fn test_round_robin_balance() {
        let lb = lb(RoundRobin);
        let replicas = replicas(3);

        let mut counts = [0usize; 3];
        for _ in 0..3 * 7 {
            counts[lb.select(&replicas).unwrap()] += 1;
        }

        // Perfectly balanced after N * K selections.
        assert_eq!(counts, [7, 7, 7]);
        assert_eq!(lb.stats().total, 21);
    }

    #[test]
    fn test_round_robin_sequence() {
        let lb = lb(RoundRobin);
        let replicas = replicas(2);

        let picks: Vec<_> = (0..6).map(|_| lb.select(&replicas).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_least_connections_tie_break() {
        let lb = lb(LeastConnections);
        let mut replicas = replicas(3);
        replicas[0].active = 5;
        replicas[1].active = 2;
        replicas[2].active = 2;

        // Minimum active, earliest index wins the tie.
        assert_eq!(lb.select(&replicas), Ok(1));
    }

    #[test]
    fn test_response_time() {
        let lb = lb(ResponseTime);
        let mut replicas = replicas(3);
        replicas[0].avg_response_time = Duration::from_millis(30);
        replicas[1].avg_response_time = Duration::from_millis(10);
        replicas[2].avg_response_time = Duration::from_millis(10);

        assert_eq!(lb.select(&replicas), Ok(1));
    }

    #[test]
    fn test_weighted_without_weights_falls_back() {
        let lb = lb(Weighted);
        let replicas = replicas(2);

        let picks: Vec<_> = (0..4).map(|_| lb.select(&replicas).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_weighted_respects_zero_weight() {
        let mut weights = BTreeMap::new();
        weights.insert("db-0".to_string(), 1.0);
        weights.insert("db-1".to_string(), 0.0);

        let lb = LoadBalancer::new(LoadBalancingConfig {
            strategy: Weighted,
            weights: Some(weights),
            health_threshold: None,
        });
        let replicas = replicas(2);

        for _ in 0..20 {
            assert_eq!(lb.select(&replicas), Ok(0));
        }
    }

    #[test]
    fn test_health_aware_avoids_loaded_replica() {
        let lb = lb(HealthAware);
        let mut replicas = replicas(2);
        replicas[0].active = 10;
        replicas[0].avg_response_time = Duration::from_millis(900);
        replicas[1].active = 1;
        replicas[1].avg_response_time = Duration::from_millis(5);

        assert_eq!(lb.select(&replicas), Ok(1));
    }

    #[test]
    fn test_set_strategy() {
        let lb = lb(RoundRobin);
        lb.set_strategy(LeastConnections);
        assert_eq!(lb.strategy(), LeastConnections);
    }
}
