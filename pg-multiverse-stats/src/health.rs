use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection counts observed during a health probe.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthConnections {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
}

/// Query accounting attached to a health snapshot.
#[derive(Debug, Clone, Default, Copy, Serialize, Deserialize, PartialEq)]
pub struct HealthQueries {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub avg_response_time: Duration,
}

/// Result of the latest probe of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterHealth {
    pub cluster_id: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    /// Wall-clock time from probe start to completion.
    pub response_time: Duration,
    /// Consecutive failed probes. Resets to 0 on a healthy probe.
    pub failure_count: usize,
    /// Time since the cluster last became healthy.
    pub uptime: Duration,
    pub connections: HealthConnections,
    pub queries: HealthQueries,
    /// Probe error, when unhealthy.
    pub error: Option<String>,
}

impl ClusterHealth {
    pub fn new(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            healthy: false,
            last_check: Utc::now(),
            response_time: Duration::ZERO,
            failure_count: 0,
            uptime: Duration::ZERO,
            connections: HealthConnections::default(),
            queries: HealthQueries::default(),
            error: None,
        }
    }
}
