//! Lease-based peer membership
//!
//! Each replica keeps one Lease per peer group alive, named
//! `<group>-peer-<identity>` and labeled with the group. A peer is live while its
//! lease has been renewed within the lease duration. The live set, together
//! with leadership from [`LeaderElector`], is synced to a [`PeerFeedHub`] on
//! every refresh: published when it changes and re-sent to listeners that
//! missed it otherwise. The group leader deletes peer leases that expired
//! [`REAP_AFTER_LEASE_DURATIONS`] lease durations ago, which replicas that
//! crashed leave behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_common::{Result, FIELD_MANAGER, PEER_GROUP_LABEL};

use crate::feed::PeerFeedHub;
use crate::leader_election::{lease_expired, LeaderElector};
use crate::snapshot::PeerUpdate;

/// Lease durations past expiry after which the leader deletes a peer lease
pub const REAP_AFTER_LEASE_DURATIONS: u32 = 10;

/// Name of the lease a peer renews to announce itself
///
/// The `peer` infix keeps it apart from [`leader_lease_name`] for any id.
pub fn peer_lease_name(group: &str, identity: &str) -> String {
    format!("{group}-peer-{identity}")
}

/// Name of the lease peers contend on for leadership
pub fn leader_lease_name(group: &str) -> String {
    format!("{group}-leader")
}

/// Holders of unexpired leases, sorted and deduplicated
pub fn live_peers(leases: &[Lease], now: DateTime<Utc>) -> Vec<String> {
    let mut ids: Vec<String> = leases
        .iter()
        .filter(|l| !lease_expired(l.spec.as_ref(), now))
        .filter_map(|l| l.spec.as_ref()?.holder_identity.clone())
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Leases that expired more than `grace` ago
///
/// Leases that were never renewed are left alone.
pub fn stale_leases(leases: &[Lease], now: DateTime<Utc>, grace: chrono::Duration) -> Vec<&Lease> {
    leases
        .iter()
        .filter(|l| l.spec.as_ref().and_then(|s| s.renew_time.as_ref()).is_some())
        .filter(|l| lease_expired(l.spec.as_ref(), now - grace))
        .collect()
}

/// Settings for lease-based membership
#[derive(Clone, Debug)]
pub struct LeaseMembershipConfig {
    /// Namespace holding the peer leases
    pub namespace: String,
    /// Peer group name; replicas in the same group share clusters
    pub group: String,
    /// This replica's identity
    pub identity: String,
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How often the lease is renewed and membership re-listed
    pub renew_interval: Duration,
}

/// Publishes the live peer set of one group
pub struct LeaseMembership {
    client: Client,
    config: LeaseMembershipConfig,
    hub: Arc<PeerFeedHub>,
    leader: Arc<LeaderElector>,
}

impl LeaseMembership {
    /// Create membership for the configured group
    pub fn new(client: Client, config: LeaseMembershipConfig) -> Self {
        let leader = LeaderElector::new(
            client.clone(),
            &leader_lease_name(&config.group),
            &config.namespace,
            &config.identity,
        )
        .with_timing(config.lease_duration, config.renew_interval);

        Self {
            client,
            config,
            hub: Arc::new(PeerFeedHub::new()),
            leader: Arc::new(leader),
        }
    }

    /// Feed that listeners subscribe to
    pub fn hub(&self) -> Arc<PeerFeedHub> {
        Arc::clone(&self.hub)
    }

    /// Leader elector for the group
    pub fn leader(&self) -> Arc<LeaderElector> {
        Arc::clone(&self.leader)
    }

    /// Renew, list and publish until cancelled, then withdraw this peer
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let election = tokio::spawn(Arc::clone(&self.leader).run(token.clone()));

        info!(
            identity = %self.config.identity,
            group = %self.config.group,
            "Starting lease membership"
        );

        loop {
            match self.refresh(&api).await {
                Ok(update) => self.hub.sync(update),
                Err(e) => warn!(identity = %self.config.identity, error = %e, "Membership refresh failed"),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.renew_interval) => {}
            }
        }

        let name = peer_lease_name(&self.config.group, &self.config.identity);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => info!(lease = %name, "Peer lease withdrawn"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!(lease = %name, error = %e, "Failed to withdraw peer lease"),
        }

        if let Err(e) = election.await {
            warn!(error = %e, "Leader election task ended abnormally");
        }
    }

    async fn refresh(&self, api: &Api<Lease>) -> Result<PeerUpdate> {
        self.renew(api).await?;

        let selector = format!("{}={}", PEER_GROUP_LABEL, self.config.group);
        let leases = api.list(&ListParams::default().labels(&selector)).await?;
        let now = Utc::now();
        let leader = self.leader.is_leader();
        if leader {
            self.reap(api, &leases.items, now).await;
        }

        Ok(PeerUpdate {
            ids: live_peers(&leases.items, now),
            ready: true,
            leader,
        })
    }

    /// Delete leases left behind by peers that stopped without withdrawing
    async fn reap(&self, api: &Api<Lease>, leases: &[Lease], now: DateTime<Utc>) {
        let lease_secs = i64::try_from(self.config.lease_duration.as_secs()).unwrap_or(i64::MAX);
        let grace = chrono::Duration::seconds(
            lease_secs.saturating_mul(i64::from(REAP_AFTER_LEASE_DURATIONS)),
        );

        for lease in stale_leases(leases, now, grace) {
            let name = lease.name_any();
            // Only delete the version we saw; a peer that came back keeps its lease.
            let params = DeleteParams {
                preconditions: Some(Preconditions {
                    resource_version: lease.metadata.resource_version.clone(),
                    uid: None,
                }),
                ..Default::default()
            };
            match api.delete(&name, &params).await {
                Ok(_) => info!(lease = %name, "Reaped expired peer lease"),
                Err(kube::Error::Api(e)) if e.code == 404 || e.code == 409 => {
                    debug!(lease = %name, code = e.code, "Peer lease changed before reaping")
                }
                Err(e) => warn!(lease = %name, error = %e, "Failed to reap peer lease"),
            }
        }
    }

    async fn renew(&self, api: &Api<Lease>) -> Result<()> {
        let name = peer_lease_name(&self.config.group, &self.config.identity);
        let lease = json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": name,
                "namespace": self.config.namespace,
                "labels": { PEER_GROUP_LABEL: self.config.group }
            },
            "spec": {
                "holderIdentity": self.config.identity,
                "leaseDurationSeconds": self.config.lease_duration.as_secs(),
                "renewTime": MicroTime(Utc::now())
            }
        });

        api.patch(
            &name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&lease),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::coordination::v1::LeaseSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn lease(holder: &str, renewed_secs_ago: i64) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(peer_lease_name("fleet", holder)),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                lease_duration_seconds: Some(30),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn lease_names_are_scoped_by_group() {
        assert_eq!(peer_lease_name("fleet", "pod-0"), "fleet-peer-pod-0");
        assert_eq!(leader_lease_name("fleet"), "fleet-leader");
    }

    #[test]
    fn peer_named_leader_keeps_its_own_lease() {
        assert_ne!(peer_lease_name("fleet", "leader"), leader_lease_name("fleet"));
    }

    #[test]
    fn only_long_expired_leases_are_stale() {
        let grace = chrono::Duration::seconds(300);
        let mut never_renewed = lease("new", 0);
        never_renewed.spec.as_mut().unwrap().renew_time = None;
        let leases = vec![lease("live", 1), lease("expired", 120), lease("gone", 400), never_renewed];

        let stale: Vec<_> = stale_leases(&leases, Utc::now(), grace)
            .into_iter()
            .map(|l| l.spec.as_ref().unwrap().holder_identity.clone().unwrap())
            .collect();
        assert_eq!(stale, vec!["gone"]);
    }

    #[test]
    fn only_unexpired_holders_are_live() {
        let leases = vec![lease("c", 1), lease("a", 5), lease("stale", 120)];
        assert_eq!(live_peers(&leases, Utc::now()), vec!["a", "c"]);
    }

    #[test]
    fn duplicate_and_blank_holders_are_dropped() {
        let mut blank = lease("x", 0);
        blank.spec.as_mut().unwrap().holder_identity = Some(String::new());
        let mut unheld = lease("y", 0);
        unheld.spec.as_mut().unwrap().holder_identity = None;

        let leases = vec![lease("a", 0), lease("a", 2), blank, unheld];
        assert_eq!(live_peers(&leases, Utc::now()), vec!["a"]);
    }

    #[test]
    fn no_leases_means_no_peers() {
        assert!(live_peers(&[], Utc::now()).is_empty());
    }
}
