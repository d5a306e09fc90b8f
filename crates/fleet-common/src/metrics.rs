//! Metrics registry for fleet cluster ownership
//!
//! Provides OpenTelemetry metrics for:
//! - Which peer owns which cluster
//! - Full reconciliation passes (duration, per-cluster errors)
//! - Size of the peer set

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for fleet metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("fleet"));

/// Gauge set to 1 when a peer owns a cluster and 0 when it does not
///
/// Labels:
/// - `peer`: peer identity
/// - `cluster`: cluster name
pub static CLUSTER_OWNER: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("fleet_cluster_owner")
        .with_description("Whether this peer owns the cluster's controllers (1) or not (0)")
        .with_unit("{owner}")
        .build()
});

/// Histogram of full reconciliation pass duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_ALL_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("fleet_reconcile_all_duration_seconds")
        .with_description("Duration of a full cluster reconciliation pass in seconds")
        .with_unit("s")
        .build()
});

/// Counter of per-cluster reconciliation errors
///
/// Labels:
/// - `cluster`: cluster name
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("fleet_reconcile_errors_total")
        .with_description("Total number of per-cluster reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Gauge of the number of peers in the last applied snapshot
pub static PEERS_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("fleet_peers_total")
        .with_description("Number of peers in the current peer snapshot")
        .with_unit("{peers}")
        .build()
});

/// Record the ownership decision for one cluster
pub fn record_owner(peer: &str, cluster: &str, owner: bool) {
    CLUSTER_OWNER.record(
        i64::from(owner),
        &[
            KeyValue::new("peer", peer.to_string()),
            KeyValue::new("cluster", cluster.to_string()),
        ],
    );
}

/// Record the size of the applied peer set
pub fn record_peer_count(count: usize) {
    PEERS_TOTAL.record(i64::try_from(count).unwrap_or(i64::MAX), &[]);
}

/// Record a failed reconciliation of one cluster
pub fn record_reconcile_error(cluster: &str) {
    RECONCILE_ERRORS.add(1, &[KeyValue::new("cluster", cluster.to_string())]);
}

/// Times one full reconciliation pass
pub struct ReconcileAllTimer {
    start: Instant,
}

impl ReconcileAllTimer {
    /// Start timing a pass
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the pass outcome
    pub fn finish(self, success: bool) {
        let result = if success { "success" } else { "error" };
        RECONCILE_ALL_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}
