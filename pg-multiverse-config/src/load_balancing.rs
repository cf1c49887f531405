use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which strategy to use for picking a replica for read queries.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash, Copy)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Distribute queries in a round-robin sequence (default).
    #[default]
    RoundRobin,
    /// Weighted random draw over per-replica weights.
    Weighted,
    /// Route to the replica with the fewest active connections.
    LeastConnections,
    /// Route to the replica with the lowest average response time.
    ResponseTime,
    /// Composite score over load, latency, and weight.
    HealthAware,
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', '-'], "").as_str() {
            "roundrobin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "leastconnections" => Ok(Self::LeastConnections),
            "responsetime" => Ok(Self::ResponseTime),
            "healthaware" => Ok(Self::HealthAware),
            _ => Err(format!("Invalid load balancing strategy: {}", s)),
        }
    }
}

impl Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::RoundRobin => "round_robin",
            Self::Weighted => "weighted",
            Self::LeastConnections => "least_connections",
            Self::ResponseTime => "response_time",
            Self::HealthAware => "health_aware",
        };

        write!(f, "{}", display)
    }
}

/// Load balancing settings for one cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    /// Per-replica weights, keyed by replica id. Required for `weighted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<BTreeMap<String, f64>>,
    /// Minimum `health_aware` score before a replica is deprioritized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_threshold: Option<f64>,
}
