//! Pool identity.

use serde::{Deserialize, Serialize};

/// Role a server performs in a cluster.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Primary,
    Replica,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// Identity of one pool: cluster, role, and replica position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolId {
    pub cluster_id: String,
    pub role: Role,
    pub replica_index: Option<usize>,
}

impl PoolId {
    pub fn primary(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            role: Role::Primary,
            replica_index: None,
        }
    }

    pub fn replica(cluster_id: &str, index: usize) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            role: Role::Replica,
            replica_index: Some(index),
        }
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.role {
            Role::Primary => write!(f, "{}_primary", self.cluster_id),
            Role::Replica => write!(
                f,
                "{}_replica_{}",
                self.cluster_id,
                self.replica_index.unwrap_or(0)
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PoolId::primary("main").to_string(), "main_primary");
        assert_eq!(PoolId::replica("main", 2).to_string(), "main_replica_2");
    }
}
