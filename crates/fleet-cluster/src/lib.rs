//! Per-cluster controller lifecycle driven by peer ownership
//!
//! The [`ClusterReconciler`] turns ManagedCluster events and periodic full
//! passes into start/stop calls on a [`ControllerLifecycle`], using the
//! ownership decision from [`fleet_peer`]. A host server embeds it through
//! [`OwnershipRuntime`], configured by [`OwnershipConfig`].

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod direct_access;
pub mod finalizer;
pub mod lifecycle;
pub mod metrics;
pub mod queue;
pub mod runner;
pub mod store;

pub use config::OwnershipConfig;
pub use controller::ClusterReconciler;
pub use direct_access::DirectAccess;
pub use lifecycle::{ControllerFuture, ControllerLifecycle, ControllerSetFactory, ControllerSetRegistry};
pub use metrics::{OtelOwnershipMetrics, OwnershipMetrics};
pub use queue::{ClusterKey, ResyncQueue, ResyncReceiver};
pub use runner::{run_event_loop, OwnershipRuntime, REQUEUE_DELAY};
pub use store::{ClusterStore, KubeClusterStore};
