use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionConfig;
use crate::load_balancing::LoadBalancingConfig;
use crate::pooling::PoolOptions;
use crate::sharding::ShardingConfig;

/// Where read queries for a cluster should go.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    /// Prefer replicas, fall back to the primary (default).
    #[default]
    Replica,
    /// Always read from the primary.
    Primary,
    /// No preference.
    Any,
}

impl FromStr for ReadPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "replica" => Ok(Self::Replica),
            "primary" => Ok(Self::Primary),
            "any" => Ok(Self::Any),
            _ => Err(format!("Invalid read preference: {}", s)),
        }
    }
}

/// Consistency demanded by reads against the cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    /// Replica reads are allowed (default).
    #[default]
    Eventual,
    /// Reads go to the primary.
    Strong,
}

impl FromStr for ConsistencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eventual" => Ok(Self::Eventual),
            "strong" => Ok(Self::Strong),
            _ => Err(format!("Invalid consistency level: {}", s)),
        }
    }
}

impl Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::Eventual => "eventual",
            Self::Strong => "strong",
        };

        write!(f, "{}", display)
    }
}

/// How aggressively results for a schema are cached.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    Aggressive,
    #[default]
    Conservative,
    None,
}

/// One cluster in the configuration document: a primary, optional
/// replicas, and the schemas the cluster serves.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterConfig {
    /// Schemas routed to this cluster. Each schema may appear in at most
    /// one cluster across the document.
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Routing priority when no schema is specified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub read_preference: ReadPreference,
    #[serde(default)]
    pub consistency_level: ConsistencyLevel,
    /// The write server.
    pub primary: ConnectionConfig,
    /// Read servers, in configuration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ConnectionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_pool: Option<PoolOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_strategy: Option<CacheStrategy>,
}

impl ClusterConfig {
    /// Pool settings, defaulted when the document omits them.
    pub fn pool_options(&self) -> PoolOptions {
        self.connection_pool.unwrap_or_default()
    }

    /// Load balancing settings, defaulted when the document omits them.
    pub fn load_balancing(&self) -> LoadBalancingConfig {
        self.load_balancing.clone().unwrap_or_default()
    }
}

/// Routing metadata for one schema, derived from the cluster that owns it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMapping {
    pub cluster_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<String>,
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    #[serde(default)]
    pub priority: i32,
}
