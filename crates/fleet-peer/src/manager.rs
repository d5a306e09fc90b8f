//! Peer state: the single piece of shared mutable state in ownership
//!
//! [`PeerState`] holds the current [`PeerSnapshot`] behind one lock that is
//! only ever held for a pointer swap or clone. [`PeerStateManager`] applies
//! membership updates to it and then asks the reconciler for a full resync,
//! after the lock has been released.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fleet_common::{metrics, Result};

use crate::ownership::OwnershipStrategy;
use crate::snapshot::{PeerSnapshot, PeerUpdate};

/// Full reconciliation of every known cluster
///
/// Implemented by the cluster reconciler; called after each applied snapshot.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resync: Send + Sync {
    /// Recompute ownership for every cluster and drive start/stop accordingly
    async fn resync_all(&self) -> Result<()>;
}

/// Current peer snapshot plus the ownership rule applied to it
pub struct PeerState {
    self_id: String,
    clustered: bool,
    strategy: OwnershipStrategy,
    current: Mutex<Arc<PeerSnapshot>>,
}

impl PeerState {
    /// A replica running without any peer feed; it owns every cluster
    pub fn standalone(self_id: impl Into<String>) -> Self {
        Self::build(self_id.into(), false, OwnershipStrategy::default())
    }

    /// A replica sharing clusters with peers
    ///
    /// Owns nothing until the first ready snapshot is applied.
    pub fn clustered(self_id: impl Into<String>, strategy: OwnershipStrategy) -> Self {
        Self::build(self_id.into(), true, strategy)
    }

    fn build(self_id: String, clustered: bool, strategy: OwnershipStrategy) -> Self {
        Self {
            current: Mutex::new(Arc::new(PeerSnapshot::empty(self_id.clone()))),
            self_id,
            clustered,
            strategy,
        }
    }

    /// This replica's identity
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Whether a peer feed is configured
    pub fn is_clustered(&self) -> bool {
        self.clustered
    }

    /// Placement strategy in use
    pub fn strategy(&self) -> OwnershipStrategy {
        self.strategy
    }

    /// The latest applied snapshot
    pub fn snapshot(&self) -> Arc<PeerSnapshot> {
        Arc::clone(&self.current.lock())
    }

    /// Whether this replica owns the cluster with the given uid right now
    pub fn is_owner(&self, uid: &str) -> bool {
        if !self.clustered {
            return self.strategy.is_owner(None, uid);
        }
        let snapshot = self.snapshot();
        self.strategy.is_owner(Some(&snapshot), uid)
    }

    /// Replace the snapshot wholesale, returning the previous one
    fn replace(&self, update: PeerUpdate) -> (Arc<PeerSnapshot>, Arc<PeerSnapshot>) {
        let next = Arc::new(PeerSnapshot::from_update(self.self_id.clone(), update));
        let previous = std::mem::replace(&mut *self.current.lock(), Arc::clone(&next));
        (previous, next)
    }
}

/// Applies membership updates and triggers full resyncs
pub struct PeerStateManager {
    state: Arc<PeerState>,
    resync: Arc<dyn Resync>,
}

impl PeerStateManager {
    /// Create a manager over the given state
    pub fn new(state: Arc<PeerState>, resync: Arc<dyn Resync>) -> Self {
        Self { state, resync }
    }

    /// Shared peer state
    pub fn state(&self) -> &Arc<PeerState> {
        &self.state
    }

    /// Apply an optional membership update, then resync every cluster
    ///
    /// `None` forces a resync without a membership change. A failed resync
    /// is returned but does not roll the snapshot back.
    pub async fn apply_snapshot(&self, update: Option<PeerUpdate>) -> Result<()> {
        if let Some(update) = update {
            let (previous, next) = self.state.replace(update);
            metrics::record_peer_count(next.len());
            if previous.ids() != next.ids() || previous.ready() != next.ready() {
                info!(
                    peer = %next.self_id(),
                    peers = ?next.ids(),
                    ready = next.ready(),
                    leader = next.leader(),
                    "Peer membership changed"
                );
            } else {
                debug!(peer = %next.self_id(), leader = next.leader(), "Peer snapshot refreshed");
            }
        }

        self.resync.resync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::Error;

    fn update(ids: &[&str], ready: bool, leader: bool) -> PeerUpdate {
        PeerUpdate {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            ready,
            leader,
        }
    }

    fn resync_ok(times: usize) -> Arc<MockResync> {
        let mut resync = MockResync::new();
        resync.expect_resync_all().times(times).returning(|| Ok(()));
        Arc::new(resync)
    }

    #[test]
    fn standalone_owns_everything_regardless_of_snapshot() {
        let state = PeerState::standalone("solo");
        assert!(!state.is_clustered());
        assert!(state.snapshot().is_empty());
        assert!(state.is_owner("any-uid"));
        assert!(state.is_owner(""));
    }

    #[test]
    fn clustered_owns_nothing_before_first_update() {
        let state = PeerState::clustered("a", OwnershipStrategy::RangeScaling);
        assert!(state.is_clustered());
        assert!(!state.is_owner("Z"));
    }

    #[tokio::test]
    async fn apply_replaces_ids_with_self_appended() {
        let state = Arc::new(PeerState::clustered("b", OwnershipStrategy::RangeScaling));
        let manager = PeerStateManager::new(Arc::clone(&state), resync_ok(1));

        manager
            .apply_snapshot(Some(update(&["c", "a"], true, false)))
            .await
            .unwrap();

        let snap = state.snapshot();
        assert_eq!(snap.ids(), ["a", "b", "c"]);
        assert!(snap.ready());
        // crc32("Z") scales to index 1 of 3
        assert!(state.is_owner("Z"));
    }

    #[tokio::test]
    async fn apply_none_only_resyncs() {
        let state = Arc::new(PeerState::clustered("a", OwnershipStrategy::RangeScaling));
        let manager = PeerStateManager::new(Arc::clone(&state), resync_ok(1));

        let before = state.snapshot();
        manager.apply_snapshot(None).await.unwrap();
        assert!(Arc::ptr_eq(&before, &state.snapshot()));
    }

    #[tokio::test]
    async fn snapshots_are_replaced_not_mutated() {
        let state = Arc::new(PeerState::clustered("a", OwnershipStrategy::RangeScaling));
        let manager = PeerStateManager::new(Arc::clone(&state), resync_ok(2));

        manager
            .apply_snapshot(Some(update(&["b"], true, false)))
            .await
            .unwrap();
        let held = state.snapshot();

        manager
            .apply_snapshot(Some(update(&["b", "c"], true, false)))
            .await
            .unwrap();

        assert_eq!(held.ids(), ["a", "b"]);
        assert_eq!(state.snapshot().ids(), ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failed_resync_keeps_the_new_snapshot() {
        let state = Arc::new(PeerState::clustered("a", OwnershipStrategy::RangeScaling));
        let mut resync = MockResync::new();
        resync
            .expect_resync_all()
            .times(1)
            .returning(|| Err(Error::controller("prod", "start failed")));
        let manager = PeerStateManager::new(Arc::clone(&state), Arc::new(resync));

        let result = manager
            .apply_snapshot(Some(update(&["b"], true, false)))
            .await;

        assert!(result.is_err());
        assert_eq!(state.snapshot().ids(), ["a", "b"]);
    }

    #[tokio::test]
    async fn resync_can_read_state_without_deadlock() {
        struct ReadingResync(Arc<PeerState>);

        #[async_trait]
        impl Resync for ReadingResync {
            async fn resync_all(&self) -> Result<()> {
                let _ = self.0.snapshot();
                let _ = self.0.is_owner("Z");
                Ok(())
            }
        }

        let state = Arc::new(PeerState::clustered("a", OwnershipStrategy::RangeScaling));
        let manager = PeerStateManager::new(
            Arc::clone(&state),
            Arc::new(ReadingResync(Arc::clone(&state))),
        );
        manager
            .apply_snapshot(Some(update(&["b"], true, false)))
            .await
            .unwrap();
    }
}
