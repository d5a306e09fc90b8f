//! Custom Resource Definitions for fleet
//!
//! Clusters are created and deleted by the cluster store; fleet only reads
//! them and patches finalizers and the direct-access label.

mod cluster;
mod types;

pub use cluster::{ManagedCluster, ManagedClusterSpec, ManagedClusterStatus};
pub use types::{Condition, ConditionStatus, PROVISIONED_CONDITION};
