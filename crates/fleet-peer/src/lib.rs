//! Peer membership and cluster ownership for fleet replicas
//!
//! Every replica of the management server computes, independently and
//! identically, which single peer owns each cluster. There is no coordinator:
//! ownership is a pure function of the current peer snapshot and the
//! cluster's uid, recomputed on every reconciliation pass.
//!
//! Membership arrives through a [`PeerFeed`] (Kubernetes Leases in production)
//! and is applied by the [`PeerStateManager`], which triggers a full resync
//! after each update. Two background tasks keep it fed: a listener on the feed
//! and a periodic safety-net resync.

#![deny(missing_docs)]

pub mod feed;
pub mod leader_election;
pub mod lease;
pub mod manager;
pub mod ownership;
pub mod snapshot;
pub mod tasks;

pub use feed::{ListenerId, PeerFeed, PeerFeedHub};
pub use leader_election::LeaderElector;
pub use lease::{live_peers, LeaseMembership, LeaseMembershipConfig};
pub use manager::{PeerState, PeerStateManager, Resync};
pub use ownership::{is_owner, OwnershipStrategy};
pub use snapshot::{PeerSnapshot, PeerUpdate};
pub use tasks::{run_peer_listener, run_periodic_resync, ResyncSchedule, PEER_QUEUE_CAPACITY};
