//! Peer membership feed
//!
//! A feed pushes [`PeerUpdate`]s to registered listeners. [`PeerFeedHub`] is
//! the in-process fan-out used by the lease-based membership source; tests
//! publish to it directly.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::snapshot::PeerUpdate;

/// Handle returned when a listener registers with a feed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Source of peer membership updates
pub trait PeerFeed: Send + Sync {
    /// Register a listener channel; updates are pushed to it until removed
    fn add_listener(&self, tx: mpsc::Sender<PeerUpdate>) -> ListenerId;

    /// Unregister a listener; unknown ids are ignored
    fn remove_listener(&self, id: ListenerId);
}

/// Fan-out of membership updates to bounded listener channels
///
/// Publishing never blocks: a listener whose queue is full misses that
/// update and is flagged. [`PeerFeedHub::sync`] re-sends the current view
/// to flagged listeners, so a source that syncs on every refresh delivers
/// the latest membership once the listener drains its queue. Listeners whose
/// receiver has been dropped are pruned on the next delivery.
#[derive(Default)]
pub struct PeerFeedHub {
    next_id: AtomicU64,
    listeners: DashMap<ListenerId, Listener>,
    last: Mutex<Option<PeerUpdate>>,
}

struct Listener {
    tx: mpsc::Sender<PeerUpdate>,
    missed: bool,
}

impl PeerFeedHub {
    /// Create a hub with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an update to every listener
    pub fn publish(&self, update: PeerUpdate) {
        let mut last = self.last.lock();
        *last = Some(update.clone());
        self.deliver(&update, false);
    }

    /// Publish the current view if it changed, otherwise re-send it to
    /// listeners that missed it
    pub fn sync(&self, update: PeerUpdate) {
        let mut last = self.last.lock();
        if last.as_ref() == Some(&update) {
            self.deliver(&update, true);
        } else {
            debug!(peers = ?update.ids, leader = update.leader, "Publishing peer update");
            *last = Some(update.clone());
            self.deliver(&update, false);
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Most recently published update
    pub fn last(&self) -> Option<PeerUpdate> {
        self.last.lock().clone()
    }

    // Callers hold the `last` lock so registration cannot interleave.
    fn deliver(&self, update: &PeerUpdate, only_missed: bool) {
        let mut closed = Vec::new();
        for mut entry in self.listeners.iter_mut() {
            let id = *entry.key();
            let listener = entry.value_mut();
            if only_missed && !listener.missed {
                continue;
            }
            match listener.tx.try_send(update.clone()) {
                Ok(()) => listener.missed = false,
                Err(TrySendError::Full(_)) => {
                    if !listener.missed {
                        warn!(listener = id.0, "Peer listener queue full, dropping update");
                    }
                    listener.missed = true;
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            debug!(listener = id.0, "Pruning closed peer listener");
            self.listeners.remove(&id);
        }
    }
}

impl PeerFeed for PeerFeedHub {
    fn add_listener(&self, tx: mpsc::Sender<PeerUpdate>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let last = self.last.lock();
        // Late joiners start from the current membership.
        let missed = match last.as_ref() {
            Some(update) => tx.try_send(update.clone()).is_err(),
            None => false,
        };
        self.listeners.insert(id, Listener { tx, missed });
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(&id);
    }
}
