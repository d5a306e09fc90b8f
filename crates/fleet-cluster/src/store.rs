//! Access to ManagedCluster objects
//!
//! The reconciler never caches clusters: every full pass lists them again.

use async_trait::async_trait;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::ManagedCluster;
use fleet_common::{Error, Result};

/// Read/write access to clusters
///
/// `update` uses the object's resourceVersion; a concurrent write surfaces as
/// [`Error::Conflict`] and the caller requeues.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch a cluster by name; `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<ManagedCluster>>;

    /// Persist metadata changes to a cluster
    async fn update(&self, cluster: &ManagedCluster) -> Result<ManagedCluster>;

    /// List clusters matching a label selector; empty selects all
    async fn list(&self, label_selector: &str) -> Result<Vec<ManagedCluster>>;
}

/// [`ClusterStore`] backed by the Kubernetes API
pub struct KubeClusterStore {
    api: Api<ManagedCluster>,
}

impl KubeClusterStore {
    /// Create a store over the cluster-scoped ManagedCluster API
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get(&self, name: &str) -> Result<Option<ManagedCluster>> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube_for(name, e))
    }

    async fn update(&self, cluster: &ManagedCluster) -> Result<ManagedCluster> {
        let name = cluster.name_any();
        self.api
            .replace(&name, &PostParams::default(), cluster)
            .await
            .map_err(|e| Error::from_kube_for(name, e))
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<ManagedCluster>> {
        let params = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        Ok(self.api.list(&params).await?.items)
    }
}
