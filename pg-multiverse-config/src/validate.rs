//! Validation of the configuration document.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::connection::ConnectionConfig;
use crate::core::Config;
use crate::load_balancing::LoadBalancingStrategy;
use crate::sharding::ShardingStrategy;

/// Outcome of validating a configuration document.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Validation {
    pub fn check(config: &Config) -> Self {
        let mut errors = vec![];
        let mut warnings = vec![];

        if config.clusters.is_empty() {
            errors.push("at least one cluster is required".to_string());
        }

        let mut schema_owners: HashMap<&str, &str> = HashMap::new();

        for (id, cluster) in &config.clusters {
            Self::check_cluster(id, cluster, &mut errors, &mut warnings);

            for schema in &cluster.schemas {
                if let Some(owner) = schema_owners.insert(schema, id) {
                    errors.push(format!(
                        "schema \"{}\" is mapped to both \"{}\" and \"{}\"",
                        schema, owner, id
                    ));
                }
            }
        }

        Validation {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn check_cluster(
        id: &str,
        cluster: &ClusterConfig,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        Self::check_connection(id, "primary", &cluster.primary, errors);

        for (index, replica) in cluster.replicas.iter().enumerate() {
            Self::check_connection(id, &format!("replica {}", index), replica, errors);
        }

        if cluster.schemas.is_empty() {
            warnings.push(format!("cluster \"{}\" serves no schemas", id));
        }

        if let Some(sharding) = &cluster.sharding {
            if sharding.key.is_empty() {
                errors.push(format!("cluster \"{}\": sharding key is required", id));
            }

            let field_present = match sharding.strategy {
                ShardingStrategy::Hash => sharding.partitions.is_some(),
                ShardingStrategy::Range => sharding.ranges.is_some(),
                ShardingStrategy::Directory => sharding.directory.is_some(),
            };

            if !field_present {
                errors.push(format!(
                    "cluster \"{}\": sharding strategy \"{}\" requires its {} field",
                    id,
                    sharding.strategy,
                    match sharding.strategy {
                        ShardingStrategy::Hash => "partitions",
                        ShardingStrategy::Range => "ranges",
                        ShardingStrategy::Directory => "directory",
                    }
                ));
            }
        }

        if let Some(lb) = &cluster.load_balancing {
            if lb.strategy == LoadBalancingStrategy::Weighted
                && lb.weights.as_ref().map(|w| w.is_empty()).unwrap_or(true)
            {
                errors.push(format!(
                    "cluster \"{}\": weighted load balancing requires weights",
                    id
                ));
            }
        }
    }

    fn check_connection(
        cluster: &str,
        which: &str,
        conn: &ConnectionConfig,
        errors: &mut Vec<String>,
    ) {
        let mut missing = vec![];

        if conn.host.is_empty() {
            missing.push("host");
        }
        if conn.database.is_empty() {
            missing.push("database");
        }
        if conn.user.is_empty() {
            missing.push("user");
        }
        if conn.password.is_empty() {
            missing.push("password");
        }

        for field in missing {
            errors.push(format!(
                "cluster \"{}\" {}: {} is required",
                cluster, which, field
            ));
        }

        if conn.port == 0 {
            errors.push(format!(
                "cluster \"{}\" {}: port must be between 1 and 65535",
                cluster, which
            ));
        }

        if let Some(max) = conn.max_connections {
            if max < 1 {
                errors.push(format!(
                    "cluster \"{}\" {}: maxConnections must be at least 1",
                    cluster, which
                ));
            }
        }
    }
}
