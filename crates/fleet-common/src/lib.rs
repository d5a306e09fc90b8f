//! Common types for fleet: the ManagedCluster resource, errors, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for fleet system resources (peer leases, leader lease)
pub const FLEET_SYSTEM_NAMESPACE: &str = "fleet-system";

/// Legacy finalizer released when a cluster is deleted
///
/// Older releases blocked cluster deletion on the per-cluster agent controller.
/// Deleting clusters must not wait on a controller that may never run again,
/// so this entry is dropped during deletion handling.
pub const LEGACY_CLEANUP_FINALIZER: &str = "fleet.dev/cluster-agent-controller-cleanup";

/// Annotation carrying the per-cluster direct-access toggle
pub const DIRECT_ACCESS_ANNOTATION: &str = "fleet.dev/direct-access";

/// Label mirroring [`DIRECT_ACCESS_ANNOTATION`] so it can be used in selectors
pub const DIRECT_ACCESS_LABEL: &str = "fleet.dev/direct-access";

/// Label placed on every peer Lease, valued with the peer group name
pub const PEER_GROUP_LABEL: &str = "fleet.dev/peer-group";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "fleet-controller";
