use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How rows are distributed when a schema is sharded.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ShardingStrategy {
    /// Hash of the shard key modulo `partitions` (default).
    #[default]
    Hash,
    /// Explicit value ranges.
    Range,
    /// Explicit value → shard mapping.
    Directory,
}

impl FromStr for ShardingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "range" => Ok(Self::Range),
            "directory" => Ok(Self::Directory),
            _ => Err(format!("Invalid sharding strategy: {}", s)),
        }
    }
}

impl Display for ShardingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::Hash => "hash",
            Self::Range => "range",
            Self::Directory => "directory",
        };

        write!(f, "{}", display)
    }
}

/// One value range owned by a shard.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShardRange {
    pub min: i64,
    pub max: i64,
    pub shard: usize,
}

/// Sharding settings for one cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShardingConfig {
    #[serde(default)]
    pub strategy: ShardingStrategy,
    /// Column used to pick the shard.
    pub key: String,
    /// Number of hash partitions. Required for `hash`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<usize>,
    /// Value ranges. Required for `range`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranges: Option<Vec<ShardRange>>,
    /// Value → shard mapping. Required for `directory`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<BTreeMap<String, usize>>,
}
