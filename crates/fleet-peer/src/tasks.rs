//! Background tasks that keep the peer state applied
//!
//! - [`run_peer_listener`] applies every membership update from a feed.
//! - [`run_periodic_resync`] forces a full resync on a timer, as a safety net
//!   for missed events or a collaborator that failed earlier.
//!
//! Both stop when their cancellation token fires. A pass that is already in
//! progress runs to completion first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::PeerFeed;
use crate::manager::PeerStateManager;

/// Capacity of the queue between a peer feed and the listener task
pub const PEER_QUEUE_CAPACITY: usize = 100;

/// Timing of the periodic safety-net resync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResyncSchedule {
    /// Wait before the first pass and after a failed one
    pub interval: Duration,
    /// Wait after a successful pass
    pub idle_interval: Duration,
}

impl Default for ResyncSchedule {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            idle_interval: Duration::from_secs(120),
        }
    }
}

/// Apply membership updates from the feed until cancelled
///
/// Apply failures are logged; the periodic resync retries them.
pub async fn run_peer_listener(
    manager: Arc<PeerStateManager>,
    feed: Arc<dyn PeerFeed>,
    token: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
    let listener = feed.add_listener(tx);
    info!(peer = %manager.state().self_id(), "Peer listener started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            update = rx.recv() => {
                let Some(update) = update else {
                    debug!("Peer feed closed");
                    break;
                };
                if let Err(e) = manager.apply_snapshot(Some(update)).await {
                    warn!(error = %e, "Failed to apply peer update");
                }
            }
        }
    }

    feed.remove_listener(listener);
    info!(peer = %manager.state().self_id(), "Peer listener stopped");
}

/// Resync every cluster on a timer until cancelled
///
/// Waits `interval` first, then `idle_interval` after each successful pass
/// and `interval` again after a failed one.
pub async fn run_periodic_resync(
    manager: Arc<PeerStateManager>,
    schedule: ResyncSchedule,
    token: CancellationToken,
) {
    let mut wait = schedule.interval;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                wait = match manager.apply_snapshot(None).await {
                    Ok(()) => schedule.idle_interval,
                    Err(e) => {
                        warn!(error = %e, retry_secs = schedule.interval.as_secs(), "Periodic resync failed");
                        schedule.interval
                    }
                };
            }
        }
    }

    debug!("Periodic resync stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use fleet_common::{Error, Result};

    use super::*;
    use crate::feed::PeerFeedHub;
    use crate::manager::{PeerState, Resync};
    use crate::ownership::OwnershipStrategy;
    use crate::snapshot::PeerUpdate;

    struct CountingResync {
        calls: AtomicUsize,
        fail: bool,
        done: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Resync for CountingResync {
        async fn resync_all(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.done.send(());
            if self.fail {
                Err(Error::controller("prod", "start failed"))
            } else {
                Ok(())
            }
        }
    }

    fn manager(fail: bool) -> (Arc<PeerStateManager>, Arc<CountingResync>, mpsc::UnboundedReceiver<()>) {
        let (done, rx) = mpsc::unbounded_channel();
        let resync = Arc::new(CountingResync {
            calls: AtomicUsize::new(0),
            fail,
            done,
        });
        let state = Arc::new(PeerState::clustered("a", OwnershipStrategy::RangeScaling));
        let manager = Arc::new(PeerStateManager::new(state, resync.clone()));
        (manager, resync, rx)
    }

    async fn advance_to(secs: u64, start: tokio::time::Instant) {
        tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn resync_backs_off_after_success() {
        let (manager, resync, _rx) = manager(false);
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(run_periodic_resync(
            manager,
            ResyncSchedule::default(),
            token.clone(),
        ));

        advance_to(4, start).await;
        assert_eq!(resync.calls.load(Ordering::SeqCst), 0);
        advance_to(6, start).await;
        assert_eq!(resync.calls.load(Ordering::SeqCst), 1);
        advance_to(124, start).await;
        assert_eq!(resync.calls.load(Ordering::SeqCst), 1);
        advance_to(126, start).await;
        assert_eq!(resync.calls.load(Ordering::SeqCst), 2);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_retries_quickly_after_failure() {
        let (manager, resync, _rx) = manager(true);
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(run_periodic_resync(
            manager,
            ResyncSchedule::default(),
            token.clone(),
        ));

        advance_to(16, start).await;
        assert_eq!(resync.calls.load(Ordering::SeqCst), 3);

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_resync_stops_without_running() {
        let (manager, resync, _rx) = manager(false);
        let token = CancellationToken::new();
        token.cancel();

        run_periodic_resync(manager, ResyncSchedule::default(), token).await;
        assert_eq!(resync.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listener_applies_updates_and_unregisters() {
        let (manager, resync, mut done) = manager(false);
        let hub = Arc::new(PeerFeedHub::new());
        let token = CancellationToken::new();

        let task = tokio::spawn(run_peer_listener(
            Arc::clone(&manager),
            hub.clone(),
            token.clone(),
        ));

        // Published before or after registration, the update still arrives.
        hub.publish(PeerUpdate {
            ids: vec!["b".to_string()],
            ready: true,
            leader: false,
        });
        done.recv().await.unwrap();

        assert_eq!(resync.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().snapshot().ids(), ["a", "b"]);

        token.cancel();
        task.await.unwrap();
        assert_eq!(hub.listener_count(), 0);
    }

    /// Resync that parks every pass until the gate opens
    struct GatedResync {
        gate: tokio::sync::Semaphore,
        entered: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Resync for GatedResync {
        async fn resync_all(&self) -> Result<()> {
            let _ = self.entered.send(());
            let _permit = self.gate.acquire().await;
            Ok(())
        }
    }

    fn peers(ids: &[&str]) -> PeerUpdate {
        PeerUpdate {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            ready: true,
            leader: false,
        }
    }

    #[tokio::test]
    async fn listener_catches_up_after_dropped_updates() {
        let (entered, mut passes) = mpsc::unbounded_channel();
        let resync = Arc::new(GatedResync {
            gate: tokio::sync::Semaphore::new(0),
            entered,
        });
        let state = Arc::new(PeerState::clustered("a", OwnershipStrategy::RangeScaling));
        let manager = Arc::new(PeerStateManager::new(state, resync.clone()));
        let hub = Arc::new(PeerFeedHub::new());
        let token = CancellationToken::new();

        hub.publish(peers(&["b"]));
        let task = tokio::spawn(run_peer_listener(
            Arc::clone(&manager),
            hub.clone(),
            token.clone(),
        ));
        passes.recv().await.unwrap();

        // The first pass is parked, so the queue fills and the final view is dropped.
        for i in 0..150 {
            hub.publish(if i % 2 == 0 { peers(&["b", "d"]) } else { peers(&["d"]) });
        }
        hub.publish(peers(&["b", "c"]));

        resync.gate.add_permits(1);
        for _ in 0..PEER_QUEUE_CAPACITY {
            passes.recv().await.unwrap();
        }
        assert_eq!(manager.state().snapshot().ids(), ["a", "d"]);

        // The next refresh reports the same view and re-sends it.
        hub.sync(peers(&["b", "c"]));
        passes.recv().await.unwrap();
        assert_eq!(manager.state().snapshot().ids(), ["a", "b", "c"]);

        token.cancel();
        task.await.unwrap();
    }
}
