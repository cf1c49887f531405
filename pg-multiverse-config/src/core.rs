use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::error::Error;
use crate::validate::Validation;

/// The configuration document: a mapping of cluster id to cluster settings.
///
/// Serialized as JSON, cluster order preserved.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Config {
    pub clusters: IndexMap<String, ClusterConfig>,
}

impl Config {
    /// Parse the JSON document.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize back to a pretty JSON document.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the document against the validation rules.
    pub fn validate(&self) -> Validation {
        Validation::check(self)
    }

    /// The cluster id owning a schema, if any.
    pub fn cluster_for_schema(&self, schema: &str) -> Option<&str> {
        self.clusters
            .iter()
            .find(|(_, cluster)| cluster.schemas.iter().any(|s| s == schema))
            .map(|(id, _)| id.as_str())
    }
}
