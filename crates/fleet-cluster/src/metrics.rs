//! Ownership metrics sink

#[cfg(test)]
use mockall::automock;

use fleet_common::metrics;

/// Receives one ownership decision per cluster per pass
#[cfg_attr(test, automock)]
pub trait OwnershipMetrics: Send + Sync {
    /// `peer` owns `cluster`
    fn set_owner(&self, peer: &str, cluster: &str);

    /// `peer` does not own `cluster`
    fn unset_owner(&self, peer: &str, cluster: &str);
}

/// Records decisions on the `fleet_cluster_owner` gauge
#[derive(Clone, Copy, Debug, Default)]
pub struct OtelOwnershipMetrics;

impl OwnershipMetrics for OtelOwnershipMetrics {
    fn set_owner(&self, peer: &str, cluster: &str) {
        metrics::record_owner(peer, cluster, true);
    }

    fn unset_owner(&self, peer: &str, cluster: &str) {
        metrics::record_owner(peer, cluster, false);
    }
}
