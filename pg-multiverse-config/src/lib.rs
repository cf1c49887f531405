// Submodules
pub mod cluster;
pub mod connection;
pub mod core;
pub mod error;
pub mod load_balancing;
pub mod pooling;
pub mod sharding;
pub mod validate;

pub use cluster::{CacheStrategy, ClusterConfig, ConsistencyLevel, ReadPreference, SchemaMapping};
pub use connection::{ConnectionConfig, SslConfig, SslOptions};
pub use core::Config;
pub use error::Error;
pub use load_balancing::{LoadBalancingConfig, LoadBalancingStrategy};
pub use pooling::PoolOptions;
pub use sharding::{ShardRange, ShardingConfig, ShardingStrategy};
pub use validate::Validation;
