//! Immutable view of the peer set

use std::sync::Arc;

/// Membership update pushed by a peer feed
///
/// The receiving replica's own identity is implicit; it is added when the
/// update is turned into a [`PeerSnapshot`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerUpdate {
    /// Known peer identities, in any order
    pub ids: Vec<String>,
    /// Whether the feed has completed initial membership discovery
    pub ready: bool,
    /// Whether this replica currently holds peer leadership
    pub leader: bool,
}

/// The peer set as seen by one replica
///
/// `ids` is sorted ascending and deduplicated; the sort order is what makes
/// ownership agree across replicas. The sequence is shared behind an `Arc`
/// and never mutated: a new membership view means a new snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSnapshot {
    self_id: String,
    ids: Arc<[String]>,
    ready: bool,
    leader: bool,
}

impl PeerSnapshot {
    /// Snapshot before any membership has been observed
    pub fn empty(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            ids: Arc::from(Vec::new()),
            ready: false,
            leader: false,
        }
    }

    /// Build a snapshot from an explicit id list
    ///
    /// Ids are sorted and deduplicated but `self_id` is not added.
    pub fn new<I, S>(self_id: impl Into<String>, ids: I, ready: bool, leader: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        Self {
            self_id: self_id.into(),
            ids: Arc::from(ids),
            ready,
            leader,
        }
    }

    /// Build the snapshot a replica applies for a feed update
    ///
    /// The replica's own id is always part of the set, whether or not the
    /// feed reported it.
    pub fn from_update(self_id: impl Into<String>, update: PeerUpdate) -> Self {
        let self_id = self_id.into();
        let mut ids = update.ids;
        ids.push(self_id.clone());
        Self::new(self_id, ids, update.ready, update.leader)
    }

    /// The same membership seen from another peer
    pub fn viewed_by(&self, self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            ids: Arc::clone(&self.ids),
            ready: self.ready,
            leader: self.leader,
        }
    }

    /// This replica's identity
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// All peer identities, sorted ascending
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Whether initial membership discovery has completed
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Whether this replica is the peer leader
    pub fn leader(&self) -> bool {
        self.leader
    }

    /// Number of peers, including self
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no peers are known
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether the peer set may be used to assign ownership at all
    ///
    /// Not while discovery is incomplete, and not as an unconfirmed singleton:
    /// two freshly started replicas would otherwise each see only themselves
    /// and both claim every cluster.
    pub fn can_assign(&self) -> bool {
        self.ready && !self.ids.is_empty() && (self.ids.len() > 1 || self.leader)
    }
}
