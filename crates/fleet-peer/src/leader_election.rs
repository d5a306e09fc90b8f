//! Peer leadership using a Kubernetes Lease
//!
//! Leadership only matters for bootstrap: a replica that sees nobody but
//! itself may claim every cluster only while it holds the leader lease.
//!
//! # Atomicity
//!
//! Acquisition and renewal write with the lease's resourceVersion. If the
//! lease changed between read and write the API server answers 409 Conflict
//! and the attempt counts as "not leader" until the next round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_common::{Error, Result};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a lease held by someone else may be taken over at `now`
///
/// A lease without renew time or duration is treated as expired.
pub fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    }
}

/// Leader elector for one peer group
///
/// Runs as a background loop that keeps trying to acquire or renew the
/// lease; [`LeaderElector::is_leader`] reflects the outcome of the last round.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: AtomicBool::new(false),
        }
    }

    /// Override lease duration and renew interval
    ///
    /// Retries happen at half the renew interval.
    pub fn with_timing(mut self, lease_duration: Duration, renew_interval: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_interval = renew_interval;
        self.retry_interval = renew_interval / 2;
        self
    }

    /// Whether the last acquire/renew round succeeded
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Name of the lease object contended for
    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    /// Contend for leadership until cancelled, then release the lease if held
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(identity = %self.identity, lease = %self.lease_name, "Starting peer leader election");

        loop {
            let leader = match self.try_acquire_or_renew().await {
                Ok(leader) => leader,
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease round failed");
                    false
                }
            };

            let was_leader = self.is_leader.swap(leader, Ordering::SeqCst);
            match (was_leader, leader) {
                (false, true) => info!(identity = %self.identity, "Peer leadership acquired"),
                (true, false) => warn!(identity = %self.identity, "Peer leadership lost"),
                _ => {}
            }

            let wait = if leader {
                self.renew_interval
            } else {
                self.retry_interval
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.is_leader.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.release_lease().await {
                warn!(identity = %self.identity, error = %e, "Failed to release leader lease");
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let Some(lease) = existing else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());
        if holder == Some(self.identity.as_str()) {
            let mut updated = lease.clone();
            if let Some(spec) = updated.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.lease_duration.as_secs() as i32);
            }
            return self.replace_lease(&api, &updated, "renew").await;
        }

        if !lease_expired(spec, now) {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        let taken = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: lease.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(self.held_spec(now, transitions + 1)),
        };
        self.replace_lease(&api, &taken, "takeover").await
    }

    fn held_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.held_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created peer leader lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_lease(&self, api: &Api<Lease>, lease: &Lease, action: &str) -> Result<bool> {
        if lease.metadata.resource_version.is_none() {
            return Err(Error::internal_with_context(
                "leader-election",
                format!("lease {} missing resourceVersion", self.lease_name),
            ));
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, action, "Lease written");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, action, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past)
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Peer leader lease released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            lease_duration_seconds: Some(duration),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!lease_expired(Some(&spec(5, 30)), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_expired(Some(&spec(31, 30)), Utc::now()));
    }

    #[test]
    fn incomplete_lease_is_expired() {
        assert!(lease_expired(None, Utc::now()));
        let mut s = spec(0, 30);
        s.renew_time = None;
        assert!(lease_expired(Some(&s), Utc::now()));
        let mut s = spec(0, 30);
        s.lease_duration_seconds = None;
        assert!(lease_expired(Some(&s), Utc::now()));
    }
}
