//! Release of the legacy cleanup finalizer
//!
//! Earlier agent controllers put a finalizer on every cluster. A deleting
//! cluster may never be served again, so the finalizer is dropped as soon as
//! deletion is requested rather than waiting for a controller to do it.

use kube::ResourceExt;
use tracing::{debug, info};

use fleet_common::crd::ManagedCluster;
use fleet_common::{Result, LEGACY_CLEANUP_FINALIZER};

use crate::store::ClusterStore;

/// Copy of `cluster` without the legacy finalizer, if it carried one
///
/// Every other finalizer is kept in order.
pub fn without_legacy_finalizer(cluster: &ManagedCluster) -> Option<ManagedCluster> {
    if !cluster.has_finalizer(LEGACY_CLEANUP_FINALIZER) {
        return None;
    }
    let mut updated = cluster.clone();
    updated
        .finalizers_mut()
        .retain(|f| f != LEGACY_CLEANUP_FINALIZER);
    Some(updated)
}

/// Remove the legacy finalizer and persist the cluster
///
/// Returns the cluster as stored afterwards. A cluster without the finalizer
/// is returned unchanged without a write, and one that is already gone
/// counts as clean.
pub async fn remove_legacy_finalizer(
    store: &dyn ClusterStore,
    cluster: &ManagedCluster,
) -> Result<ManagedCluster> {
    let name = cluster.name_any();
    let Some(updated) = without_legacy_finalizer(cluster) else {
        return Ok(cluster.clone());
    };

    match store.update(&updated).await {
        Ok(stored) => {
            info!(cluster = %name, finalizer = LEGACY_CLEANUP_FINALIZER, "Removed legacy finalizer");
            Ok(stored)
        }
        Err(e) if e.is_not_found() => {
            debug!(cluster = %name, "Cluster already gone, finalizer cleanup skipped");
            Ok(updated)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockClusterStore;
    use fleet_common::crd::ManagedClusterSpec;
    use fleet_common::Error;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn cluster(finalizers: &[&str]) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some("prod".to_string()),
                finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
                ..Default::default()
            },
            spec: ManagedClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn only_the_legacy_entry_is_removed() {
        let c = cluster(&["a.dev/keep", LEGACY_CLEANUP_FINALIZER, "b.dev/keep"]);
        let updated = without_legacy_finalizer(&c).unwrap();
        assert_eq!(updated.finalizers(), ["a.dev/keep", "b.dev/keep"]);
    }

    #[tokio::test]
    async fn absent_finalizer_is_a_noop() {
        let mut store = MockClusterStore::new();
        store.expect_update().never();

        let c = cluster(&["a.dev/keep"]);
        let result = remove_legacy_finalizer(&store, &c).await.unwrap();
        assert_eq!(result, c);
    }

    #[tokio::test]
    async fn repeated_cleanup_writes_once() {
        let mut store = MockClusterStore::new();
        store
            .expect_update()
            .times(1)
            .withf(|c| !c.has_finalizer(LEGACY_CLEANUP_FINALIZER) && c.has_finalizer("a.dev/keep"))
            .returning(|c| Ok(c.clone()));

        let c = cluster(&[LEGACY_CLEANUP_FINALIZER, "a.dev/keep"]);
        let once = remove_legacy_finalizer(&store, &c).await.unwrap();
        let twice = remove_legacy_finalizer(&store, &once).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn missing_cluster_counts_as_clean() {
        let mut store = MockClusterStore::new();
        store.expect_update().times(1).returning(|_| {
            Err(Error::NotFound {
                cluster: "prod".to_string(),
            })
        });

        let c = cluster(&[LEGACY_CLEANUP_FINALIZER]);
        assert!(remove_legacy_finalizer(&store, &c).await.is_ok());
    }

    #[tokio::test]
    async fn conflict_is_surfaced() {
        let mut store = MockClusterStore::new();
        store.expect_update().times(1).returning(|_| {
            Err(Error::Conflict {
                cluster: "prod".to_string(),
            })
        });

        let c = cluster(&[LEGACY_CLEANUP_FINALIZER]);
        let err = remove_legacy_finalizer(&store, &c).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());
    }
}
