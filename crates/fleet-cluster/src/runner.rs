//! Event loop and runtime wiring
//!
//! [`run_event_loop`] merges ManagedCluster watch events with the work queue
//! and hands each to the [`ClusterReconciler`]. [`OwnershipRuntime`] builds
//! every piece from an [`OwnershipConfig`] and spawns the background tasks.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_common::crd::ManagedCluster;
use fleet_common::Result;
use fleet_peer::{
    run_peer_listener, run_periodic_resync, LeaseMembership, PeerFeed, PeerState, PeerStateManager,
};

use crate::config::OwnershipConfig;
use crate::controller::ClusterReconciler;
use crate::lifecycle::{ControllerSetFactory, ControllerSetRegistry};
use crate::queue::{ClusterKey, ResyncQueue, ResyncReceiver};
use crate::store::KubeClusterStore;

/// Delay before a failed event is handled again
pub const REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Handle watch events and queued keys until cancelled
///
/// Events are handled one at a time; a handler that is running when the
/// token fires completes before the loop exits.
pub async fn run_event_loop<S>(
    reconciler: Arc<ClusterReconciler>,
    events: S,
    queue: ResyncQueue,
    mut keys: ResyncReceiver,
    token: CancellationToken,
) where
    S: Stream<Item = std::result::Result<Event<ManagedCluster>, watcher::Error>> + Send,
{
    let mut events = std::pin::pin!(events);
    let mut watching = true;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            key = keys.recv() => {
                let Some(key) = key else { break };
                handle_key(&reconciler, &queue, key).await;
            }
            event = events.next(), if watching => match event {
                Some(Ok(Event::Apply(cluster))) | Some(Ok(Event::InitApply(cluster))) => {
                    let key = ClusterKey::Named(cluster.name_any());
                    handle(&reconciler, &queue, key, Some(&cluster)).await;
                }
                Some(Ok(Event::Delete(cluster))) => reconciler.on_cluster_removed(&cluster).await,
                Some(Ok(Event::Init)) => debug!("Cluster watch (re)listing"),
                Some(Ok(Event::InitDone)) => {
                    debug!("Cluster watch synced");
                    queue.enqueue_all();
                }
                Some(Err(e)) => warn!(error = %e, "Cluster watch error"),
                None => {
                    warn!("Cluster watch ended");
                    watching = false;
                }
            },
        }
    }

    info!("Cluster event loop stopped");
}

async fn handle_key(reconciler: &ClusterReconciler, queue: &ResyncQueue, key: ClusterKey) {
    let ClusterKey::Named(name) = &key else {
        handle(reconciler, queue, key, None).await;
        return;
    };

    match reconciler.store().get(name).await {
        Ok(cluster) => handle(reconciler, queue, key.clone(), cluster.as_ref()).await,
        Err(e) => {
            warn!(cluster = %name, error = %e, "Failed to read cluster, requeueing");
            queue.enqueue_after(key, REQUEUE_DELAY);
        }
    }
}

async fn handle(
    reconciler: &ClusterReconciler,
    queue: &ResyncQueue,
    key: ClusterKey,
    cluster: Option<&ManagedCluster>,
) {
    if let Err(e) = reconciler.on_cluster_event(&key, cluster).await {
        if e.is_retryable() {
            warn!(cluster = %key.name(), error = %e, delay_secs = REQUEUE_DELAY.as_secs(), "Reconcile failed, requeueing");
            queue.enqueue_after(key, REQUEUE_DELAY);
        } else {
            error!(cluster = %key.name(), error = %e, "Reconcile failed");
        }
    }
}

/// Running ownership subsystem
pub struct OwnershipRuntime<F> {
    reconciler: Arc<ClusterReconciler>,
    registry: Arc<ControllerSetRegistry<F>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<F: ControllerSetFactory + 'static> OwnershipRuntime<F> {
    /// Validate the configuration, wire every component and spawn its tasks
    ///
    /// With an empty peer group no membership is tracked and this replica
    /// owns every cluster. Everything stops when `token` is cancelled.
    pub fn start(
        client: Client,
        config: &OwnershipConfig,
        factory: F,
        token: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(if config.is_clustered() {
            PeerState::clustered(config.peer_id.clone(), config.ownership_strategy)
        } else {
            PeerState::standalone(config.peer_id.clone())
        });
        let registry = Arc::new(ControllerSetRegistry::new(factory));
        let (queue, keys) = ResyncQueue::new();

        let reconciler = Arc::new(
            ClusterReconciler::new(
                Arc::clone(&state),
                Arc::new(KubeClusterStore::new(client.clone())),
                registry.clone(),
                queue.clone(),
                token.clone(),
            )
            .with_label_selector(config.cluster_label_selector.clone()),
        );
        let manager = Arc::new(PeerStateManager::new(Arc::clone(&state), reconciler.clone()));

        let mut watcher_config = watcher::Config::default();
        if !config.cluster_label_selector.is_empty() {
            watcher_config = watcher_config.labels(&config.cluster_label_selector);
        }
        let events =
            watcher::watcher(Api::<ManagedCluster>::all(client.clone()), watcher_config).default_backoff();

        let mut tasks = vec![
            tokio::spawn(run_event_loop(
                Arc::clone(&reconciler),
                events,
                queue,
                keys,
                token.clone(),
            )),
            tokio::spawn(run_periodic_resync(
                Arc::clone(&manager),
                config.resync_schedule(),
                token.clone(),
            )),
        ];

        if config.is_clustered() {
            let membership = Arc::new(LeaseMembership::new(client, config.lease_membership()));
            let feed: Arc<dyn PeerFeed> = membership.hub();
            tasks.push(tokio::spawn(membership.run(token.clone())));
            tasks.push(tokio::spawn(run_peer_listener(manager, feed, token)));
        }

        info!(
            peer = %config.peer_id,
            group = %config.peer_group,
            strategy = %config.ownership_strategy,
            clustered = config.is_clustered(),
            "Cluster ownership started"
        );

        Ok(Self {
            reconciler,
            registry,
            tasks,
        })
    }

    /// Reconciler driving the controller sets
    pub fn reconciler(&self) -> &Arc<ClusterReconciler> {
        &self.reconciler
    }

    /// Controller sets currently running
    pub fn registry(&self) -> &Arc<ControllerSetRegistry<F>> {
        &self.registry
    }

    /// Wait for every background task to finish after cancellation
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Ownership task panicked");
            }
        }
    }
}
