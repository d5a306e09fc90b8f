//! Direct-access toggle
//!
//! Users set the direct-access annotation on a cluster; the owning peer
//! mirrors it into a label of the same key so it can be selected on.

use std::collections::BTreeMap;

use fleet_common::crd::ManagedCluster;
use fleet_common::{DIRECT_ACCESS_ANNOTATION, DIRECT_ACCESS_LABEL};

/// The annotation and its label mirror as read from one cluster
///
/// Empty strings are normalised to `None`, so an empty annotation and a
/// missing label count as matching.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectAccess {
    /// Value of the direct-access annotation
    pub annotation: Option<String>,
    /// Value of the direct-access label
    pub label: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

impl DirectAccess {
    /// Read both values from a cluster
    pub fn from_cluster(cluster: &ManagedCluster) -> Self {
        Self {
            annotation: non_empty(cluster.annotation(DIRECT_ACCESS_ANNOTATION)),
            label: non_empty(cluster.label(DIRECT_ACCESS_LABEL)),
        }
    }

    /// Whether the label already mirrors the annotation
    pub fn in_sync(&self) -> bool {
        self.annotation == self.label
    }

    /// Copy of `cluster` whose label mirrors the annotation
    pub fn mirrored(&self, cluster: &ManagedCluster) -> ManagedCluster {
        let mut updated = cluster.clone();
        match &self.annotation {
            Some(value) => {
                updated
                    .metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .insert(DIRECT_ACCESS_LABEL.to_string(), value.clone());
            }
            None => {
                if let Some(labels) = updated.metadata.labels.as_mut() {
                    labels.remove(DIRECT_ACCESS_LABEL);
                }
            }
        }
        updated
    }
}
