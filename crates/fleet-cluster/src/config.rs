//! Ownership configuration
//!
//! Embedded into the host server's CLI with `#[command(flatten)]`; every
//! option can also be set through its environment variable.

use std::time::Duration;

use clap::Args;

use fleet_common::{Error, Result, FLEET_SYSTEM_NAMESPACE};
use fleet_peer::{LeaseMembershipConfig, OwnershipStrategy, ResyncSchedule};

/// Default peer group shared by all controller replicas
pub const DEFAULT_PEER_GROUP: &str = "fleet-controller";

/// Cluster ownership settings
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct OwnershipConfig {
    /// Identity of this replica among its peers
    #[arg(long, env = "POD_NAME", default_value = "")]
    pub peer_id: String,

    /// Namespace holding the peer leases
    #[arg(long, env = "FLEET_PEER_NAMESPACE", default_value = FLEET_SYSTEM_NAMESPACE)]
    pub peer_namespace: String,

    /// Peer group name; empty runs a single replica that owns every cluster
    #[arg(long, env = "FLEET_PEER_GROUP", default_value = DEFAULT_PEER_GROUP)]
    pub peer_group: String,

    /// How clusters are mapped onto peers (`range` or `rendezvous`)
    #[arg(long, env = "FLEET_OWNERSHIP_STRATEGY", default_value = "range")]
    pub ownership_strategy: OwnershipStrategy,

    /// Seconds before the first periodic resync and after a failed one
    #[arg(long, env = "FLEET_RESYNC_INTERVAL_SECS", default_value_t = 5)]
    pub resync_interval_secs: u64,

    /// Seconds between periodic resyncs after a successful one
    #[arg(long, env = "FLEET_RESYNC_IDLE_INTERVAL_SECS", default_value_t = 120)]
    pub resync_idle_interval_secs: u64,

    /// Seconds a peer lease stays valid without renewal
    #[arg(long, env = "FLEET_PEER_LEASE_DURATION_SECS", default_value_t = 30)]
    pub peer_lease_duration_secs: u64,

    /// Seconds between peer lease renewals
    #[arg(long, env = "FLEET_PEER_RENEW_INTERVAL_SECS", default_value_t = 10)]
    pub peer_renew_interval_secs: u64,

    /// Only manage clusters matching this label selector
    #[arg(long, env = "FLEET_CLUSTER_LABEL_SELECTOR", default_value = "")]
    pub cluster_label_selector: String,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            peer_namespace: FLEET_SYSTEM_NAMESPACE.to_string(),
            peer_group: DEFAULT_PEER_GROUP.to_string(),
            ownership_strategy: OwnershipStrategy::default(),
            resync_interval_secs: 5,
            resync_idle_interval_secs: 120,
            peer_lease_duration_secs: 30,
            peer_renew_interval_secs: 10,
            cluster_label_selector: String::new(),
        }
    }
}

impl OwnershipConfig {
    /// Whether replicas share clusters through a peer group
    pub fn is_clustered(&self) -> bool {
        !self.peer_group.is_empty()
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.is_clustered() && self.peer_id.is_empty() {
            return Err(Error::config(format!(
                "peer id is required when peer group '{}' is set (--peer-id or POD_NAME)",
                self.peer_group
            )));
        }

        for (name, value) in [
            ("resync-interval-secs", self.resync_interval_secs),
            ("resync-idle-interval-secs", self.resync_idle_interval_secs),
            ("peer-lease-duration-secs", self.peer_lease_duration_secs),
            ("peer-renew-interval-secs", self.peer_renew_interval_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        if self.is_clustered() && self.peer_renew_interval_secs >= self.peer_lease_duration_secs {
            return Err(Error::config(format!(
                "peer-renew-interval-secs ({}) must be shorter than peer-lease-duration-secs ({})",
                self.peer_renew_interval_secs, self.peer_lease_duration_secs
            )));
        }

        Ok(())
    }

    /// Timing of the periodic resync task
    pub fn resync_schedule(&self) -> ResyncSchedule {
        ResyncSchedule {
            interval: Duration::from_secs(self.resync_interval_secs),
            idle_interval: Duration::from_secs(self.resync_idle_interval_secs),
        }
    }

    /// Settings for lease-based membership
    pub fn lease_membership(&self) -> LeaseMembershipConfig {
        LeaseMembershipConfig {
            namespace: self.peer_namespace.clone(),
            group: self.peer_group.clone(),
            identity: self.peer_id.clone(),
            lease_duration: Duration::from_secs(self.peer_lease_duration_secs),
            renew_interval: Duration::from_secs(self.peer_renew_interval_secs),
        }
    }
}
