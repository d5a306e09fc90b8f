//! Cluster reconciler
//!
//! Decides per cluster whether its controller set runs and in which mode,
//! and keeps deletion and direct-access bookkeeping tidy. Per-cluster state
//! is never stored: each pass derives `owned-running` or `unowned-stopped`
//! from the cluster list and the current peer snapshot.
//!
//! # Event routing
//!
//! | input                          | action                                   |
//! |--------------------------------|------------------------------------------|
//! | cluster marked for deletion    | release the legacy finalizer             |
//! | any other cluster object       | direct-access sync                       |
//! | [`ClusterKey::All`]            | [`ClusterReconciler::reconcile_all`]     |
//! | named key without an object    | queue a full pass                        |

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fleet_common::crd::ManagedCluster;
use fleet_common::metrics::{self, ReconcileAllTimer};
use fleet_common::{Error, Result};
use fleet_peer::{PeerState, Resync};

use crate::direct_access::DirectAccess;
use crate::finalizer::remove_legacy_finalizer;
use crate::lifecycle::ControllerLifecycle;
use crate::metrics::{OtelOwnershipMetrics, OwnershipMetrics};
use crate::queue::{ClusterKey, ResyncQueue};
use crate::store::ClusterStore;

/// Drives controller sets from cluster events and full passes
pub struct ClusterReconciler {
    state: Arc<PeerState>,
    store: Arc<dyn ClusterStore>,
    lifecycle: Arc<dyn ControllerLifecycle>,
    metrics: Arc<dyn OwnershipMetrics>,
    queue: ResyncQueue,
    label_selector: String,
    token: CancellationToken,
}

impl ClusterReconciler {
    /// Create a reconciler that reconciles every cluster
    ///
    /// Controller sets it starts are cancelled with `token`.
    pub fn new(
        state: Arc<PeerState>,
        store: Arc<dyn ClusterStore>,
        lifecycle: Arc<dyn ControllerLifecycle>,
        queue: ResyncQueue,
        token: CancellationToken,
    ) -> Self {
        Self {
            state,
            store,
            lifecycle,
            metrics: Arc::new(OtelOwnershipMetrics),
            queue,
            label_selector: String::new(),
            token,
        }
    }

    /// Replace the ownership metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn OwnershipMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Only reconcile clusters matching this label selector
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = selector.into();
        self
    }

    /// Peer state ownership is computed from
    pub fn state(&self) -> &Arc<PeerState> {
        &self.state
    }

    /// Store clusters are read from
    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    /// Handle one event from the event loop
    #[instrument(skip(self, key, cluster), fields(key = %key.name()))]
    pub async fn on_cluster_event(&self, key: &ClusterKey, cluster: Option<&ManagedCluster>) -> Result<()> {
        match cluster {
            Some(cluster) if cluster.is_deleting() => {
                remove_legacy_finalizer(self.store.as_ref(), cluster).await?;
                Ok(())
            }
            Some(cluster) => self.sync_direct_access(cluster).await,
            None if *key == ClusterKey::All => self.reconcile_all().await,
            None => {
                self.queue.enqueue_all();
                Ok(())
            }
        }
    }

    /// Handle a cluster that disappeared from the store
    pub async fn on_cluster_removed(&self, cluster: &ManagedCluster) {
        let name = cluster.name_any();
        debug!(cluster = %name, "Cluster removed");
        self.lifecycle.stop(cluster).await;
        self.metrics.unset_owner(self.state.self_id(), &name);
        self.queue.enqueue_all();
    }

    /// Start or stop the controller set of every cluster
    ///
    /// Every cluster is attempted; failures are combined into one error.
    /// Only a failed list aborts the pass.
    #[instrument(skip(self), fields(peer = %self.state.self_id()))]
    pub async fn reconcile_all(&self) -> Result<()> {
        let timer = ReconcileAllTimer::start();

        let clusters = match self.store.list(&self.label_selector).await {
            Ok(clusters) => clusters,
            Err(e) => {
                timer.finish(false);
                return Err(e);
            }
        };

        let peer = self.state.self_id();
        let mut errors = Vec::new();
        let mut owned = 0usize;

        for cluster in &clusters {
            let name = cluster.name_any();

            if cluster.is_deleting() || !cluster.is_provisioned() {
                self.lifecycle.stop(cluster).await;
                self.metrics.unset_owner(peer, &name);
                continue;
            }

            let owner = self.state.is_owner(cluster.uid_or_empty());
            if owner {
                owned += 1;
                self.metrics.set_owner(peer, &name);
            } else {
                self.metrics.unset_owner(peer, &name);
            }

            if let Err(e) = self.lifecycle.start(self.token.clone(), cluster, owner).await {
                warn!(cluster = %name, owner, error = %e, "Failed to start controller set");
                metrics::record_reconcile_error(&name);
                errors.push(with_cluster(&name, e));
            }
        }

        debug!(clusters = clusters.len(), owned, failed = errors.len(), "Full reconciliation finished");
        let result = Error::aggregate(errors);
        timer.finish(result.is_ok());
        result
    }

    /// Mirror the direct-access annotation into its label
    ///
    /// Only the owner writes; every peer that sees a mismatch restarts the
    /// cluster's set so it picks up the new mode.
    async fn sync_direct_access(&self, cluster: &ManagedCluster) -> Result<()> {
        let access = DirectAccess::from_cluster(cluster);
        if access.in_sync() {
            return Ok(());
        }

        let name = cluster.name_any();
        let owner = self.state.is_owner(cluster.uid_or_empty());
        let current = if owner {
            let stored = self.store.update(&access.mirrored(cluster)).await?;
            info!(cluster = %name, direct_access = ?access.annotation, "Mirrored direct-access label");
            stored
        } else {
            cluster.clone()
        };

        self.lifecycle.stop(&current).await;
        if current.is_provisioned() {
            self.lifecycle
                .start(self.token.clone(), &current, owner)
                .await
                .map_err(|e| with_cluster(&name, e))?;
        }
        Ok(())
    }
}

/// Attach the cluster name unless the error already carries one
fn with_cluster(name: &str, e: Error) -> Error {
    if e.cluster().is_some() {
        e
    } else {
        Error::controller(name, e.to_string())
    }
}

#[async_trait]
impl Resync for ClusterReconciler {
    async fn resync_all(&self) -> Result<()> {
        self.reconcile_all().await
    }
}
