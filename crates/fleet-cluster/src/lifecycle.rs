//! Per-cluster controller sets
//!
//! The reconciler only decides *whether* a cluster's controllers should run
//! and in which mode. [`ControllerLifecycle`] is the seam where that decision
//! is carried out; [`ControllerSetRegistry`] is the in-process implementation
//! that spawns the futures a [`ControllerSetFactory`] builds.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fleet_common::crd::ManagedCluster;
use fleet_common::{Error, Result};

/// Starts and stops the background controllers of one cluster
///
/// Both operations must be idempotent. `owner` is false when another peer
/// owns the cluster; implementations may then run a read-only subset.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControllerLifecycle: Send + Sync {
    /// Ensure the cluster's controllers run in the given mode
    ///
    /// Controllers stop when `ctx` is cancelled.
    async fn start(&self, ctx: CancellationToken, cluster: &ManagedCluster, owner: bool) -> Result<()>;

    /// Ensure the cluster's controllers are stopped
    async fn stop(&self, cluster: &ManagedCluster);
}

/// A controller's main loop
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Builds the controllers of one cluster
pub trait ControllerSetFactory: Send + Sync {
    /// Build the futures that make up the cluster's controller set
    ///
    /// Called while the registry holds the cluster's entry, so it must not
    /// call back into the registry.
    fn build(
        &self,
        cluster: &ManagedCluster,
        owner: bool,
        token: CancellationToken,
    ) -> Result<Vec<ControllerFuture>>;
}

struct RunningSet {
    uid: String,
    owner: bool,
    token: CancellationToken,
}

/// [`ControllerLifecycle`] that runs controller sets as tokio tasks
pub struct ControllerSetRegistry<F> {
    factory: F,
    running: DashMap<String, RunningSet>,
}

impl<F: ControllerSetFactory> ControllerSetRegistry<F> {
    /// Create an empty registry
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            running: DashMap::new(),
        }
    }

    /// Whether a set is running for the named cluster
    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    /// Mode of the running set, if any
    pub fn running_owner(&self, name: &str) -> Option<bool> {
        self.running.get(name).map(|set| set.owner)
    }

    /// Number of running sets
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn spawn(&self, ctx: &CancellationToken, cluster: &ManagedCluster, owner: bool) -> Result<RunningSet> {
        let name = cluster.name_any();
        let token = ctx.child_token();
        let controllers = self
            .factory
            .build(cluster, owner, token.clone())
            .map_err(|e| Error::controller(&name, e.to_string()))?;

        let count = controllers.len();
        for controller in controllers {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = controller => {}
                }
            });
        }

        info!(cluster = %name, owner, controllers = count, "Started controller set");
        Ok(RunningSet {
            uid: cluster.uid_or_empty().to_string(),
            owner,
            token,
        })
    }
}

#[async_trait]
impl<F: ControllerSetFactory> ControllerLifecycle for ControllerSetRegistry<F> {
    async fn start(&self, ctx: CancellationToken, cluster: &ManagedCluster, owner: bool) -> Result<()> {
        let name = cluster.name_any();
        match self.running.entry(name) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.uid == cluster.uid_or_empty()
                    && current.owner == owner
                    && !current.token.is_cancelled()
                {
                    return Ok(());
                }
                debug!(cluster = %entry.key(), from = current.owner, to = owner, "Restarting controller set");
                current.token.cancel();
                match self.spawn(&ctx, cluster, owner) {
                    Ok(set) => {
                        entry.insert(set);
                        Ok(())
                    }
                    Err(e) => {
                        entry.remove();
                        Err(e)
                    }
                }
            }
            Entry::Vacant(entry) => {
                let set = self.spawn(&ctx, cluster, owner)?;
                entry.insert(set);
                Ok(())
            }
        }
    }

    async fn stop(&self, cluster: &ManagedCluster) {
        let name = cluster.name_any();
        if let Some((_, set)) = self.running.remove(&name) {
            set.token.cancel();
            info!(cluster = %name, "Stopped controller set");
        }
    }
}
