//! Connection pools, one per (cluster, role, replica).

pub mod comms;
pub mod config;
pub mod error;
pub mod guard;
pub mod id;
pub mod pool_impl;

pub use error::Error;
pub use guard::{ClusterMetadata, Guard};
pub use id::{PoolId, Role};
pub use pool_impl::{Pool, PoolInfo};

pub(crate) use comms::Comms;
pub(crate) use config::Config;
