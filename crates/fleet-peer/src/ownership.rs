//! Deterministic cluster ownership
//!
//! Every replica evaluates the same pure function over the same sorted peer
//! list, so all replicas agree on a single owner per cluster without talking
//! to each other. The hashing key is the cluster uid, never its name.
//!
//! Two placement strategies exist:
//!
//! - [`OwnershipStrategy::RangeScaling`] scales the CRC-32 of the uid into
//!   the peer list. It matches the assignments of earlier deployments but
//!   reshuffles a large share of clusters whenever the peer count changes.
//! - [`OwnershipStrategy::Rendezvous`] scores every peer against the uid and
//!   picks the highest. Losing a peer only moves the clusters it owned.

use std::fmt;
use std::str::FromStr;

use crate::snapshot::PeerSnapshot;

/// How clusters are mapped onto the peer list
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OwnershipStrategy {
    /// `ids[floor(crc32(uid) * N / 2^32)]`
    #[default]
    RangeScaling,
    /// Highest `crc32(peer ‖ 0 ‖ uid)` wins
    Rendezvous,
}

impl OwnershipStrategy {
    /// Whether this replica owns the cluster with the given uid
    ///
    /// `None` means the process runs un-clustered (no peer feed at all); the
    /// single replica then owns everything.
    pub fn is_owner(self, peers: Option<&PeerSnapshot>, uid: &str) -> bool {
        let Some(peers) = peers else {
            return true;
        };
        self.owner_of(peers, uid) == Some(peers.self_id())
    }

    /// The peer that owns the cluster, if the snapshot allows assignment
    pub fn owner_of<'a>(self, peers: &'a PeerSnapshot, uid: &str) -> Option<&'a str> {
        if !peers.can_assign() {
            return None;
        }
        let ids = peers.ids();
        let owner = match self {
            Self::RangeScaling => &ids[range_index(uid, ids.len())],
            Self::Rendezvous => ids
                .iter()
                .max_by_key(|id| (rendezvous_score(id, uid), id.as_str()))?,
        };
        Some(owner.as_str())
    }

    /// Configuration string for this strategy
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RangeScaling => "range",
            Self::Rendezvous => "rendezvous",
        }
    }
}

impl fmt::Display for OwnershipStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnershipStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "range" | "range-scaling" => Ok(Self::RangeScaling),
            "rendezvous" | "hrw" => Ok(Self::Rendezvous),
            other => Err(format!(
                "invalid ownership strategy '{other}' (expected 'range' or 'rendezvous')"
            )),
        }
    }
}

/// Whether this replica owns the cluster, using the range-scaling strategy
///
/// See [`OwnershipStrategy::is_owner`].
pub fn is_owner(peers: Option<&PeerSnapshot>, uid: &str) -> bool {
    OwnershipStrategy::RangeScaling.is_owner(peers, uid)
}

/// Index into a peer list of length `n` for the given uid
///
/// `n` must be non-zero.
pub fn range_index(uid: &str, n: usize) -> usize {
    let mut checksum = crc32fast::hash(uid.as_bytes());
    // Keeps the scaled index strictly below n.
    if checksum == u32::MAX {
        checksum -= 1;
    }
    ((u128::from(checksum) * n as u128) >> 32) as usize
}

fn rendezvous_score(peer: &str, uid: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(peer.as_bytes());
    hasher.update(&[0]);
    hasher.update(uid.as_bytes());
    hasher.finalize()
}
