//! Work queue feeding the cluster event loop
//!
//! Single-cluster edits are folded into full passes: however many times
//! [`ResyncQueue::enqueue_all`] is called, at most one [`ClusterKey::All`]
//! waits in the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

/// Work item for the event loop
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClusterKey {
    /// Reconcile every cluster
    All,
    /// Re-handle one cluster by name
    Named(String),
}

impl ClusterKey {
    /// Name for logging; `*` for a full pass
    pub fn name(&self) -> &str {
        match self {
            Self::All => "*",
            Self::Named(name) => name,
        }
    }
}

/// Sending half of the work queue
#[derive(Clone)]
pub struct ResyncQueue {
    tx: mpsc::UnboundedSender<ClusterKey>,
    pending_all: Arc<AtomicBool>,
}

/// Receiving half of the work queue
pub struct ResyncReceiver {
    rx: mpsc::UnboundedReceiver<ClusterKey>,
    pending_all: Arc<AtomicBool>,
}

impl ResyncQueue {
    /// Create a connected queue pair
    pub fn new() -> (Self, ResyncReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_all = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                pending_all: Arc::clone(&pending_all),
            },
            ResyncReceiver { rx, pending_all },
        )
    }

    /// Queue a key; `All` is coalesced
    pub fn enqueue(&self, key: ClusterKey) {
        match key {
            ClusterKey::All => self.enqueue_all(),
            key => {
                let _ = self.tx.send(key);
            }
        }
    }

    /// Queue a full pass unless one is already waiting
    pub fn enqueue_all(&self) {
        if !self.pending_all.swap(true, Ordering::SeqCst) && self.tx.send(ClusterKey::All).is_err() {
            self.pending_all.store(false, Ordering::SeqCst);
        }
    }

    /// Queue a key after a delay
    pub fn enqueue_after(&self, key: ClusterKey, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }
}

impl ResyncReceiver {
    /// Next key; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<ClusterKey> {
        let key = self.rx.recv().await?;
        if key == ClusterKey::All {
            // A pass requested from here on needs a fresh marker.
            self.pending_all.store(false, Ordering::SeqCst);
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_passes_coalesce() {
        let (queue, mut rx) = ResyncQueue::new();
        queue.enqueue_all();
        queue.enqueue(ClusterKey::Named("prod".to_string()));
        queue.enqueue_all();
        queue.enqueue(ClusterKey::All);
        drop(queue);

        assert_eq!(rx.recv().await, Some(ClusterKey::All));
        assert_eq!(rx.recv().await, Some(ClusterKey::Named("prod".to_string())));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn taking_a_pass_allows_the_next() {
        let (queue, mut rx) = ResyncQueue::new();
        queue.enqueue_all();
        assert_eq!(rx.recv().await, Some(ClusterKey::All));

        queue.enqueue_all();
        queue.enqueue_all();
        drop(queue);
        assert_eq!(rx.recv().await, Some(ClusterKey::All));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn named_keys_are_not_coalesced() {
        let (queue, mut rx) = ResyncQueue::new();
        queue.enqueue(ClusterKey::Named("a".to_string()));
        queue.enqueue(ClusterKey::Named("a".to_string()));
        drop(queue);

        assert_eq!(rx.recv().await, Some(ClusterKey::Named("a".to_string())));
        assert_eq!(rx.recv().await, Some(ClusterKey::Named("a".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_keys_arrive_after_the_delay() {
        let (queue, mut rx) = ResyncQueue::new();
        let start = tokio::time::Instant::now();
        queue.enqueue_after(ClusterKey::Named("prod".to_string()), Duration::from_secs(5));

        assert_eq!(rx.recv().await, Some(ClusterKey::Named("prod".to_string())));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn key_names() {
        assert_eq!(ClusterKey::All.name(), "*");
        assert_eq!(ClusterKey::Named("prod".to_string()).name(), "prod");
    }
}
