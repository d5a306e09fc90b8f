//! ManagedCluster Custom Resource Definition
//!
//! A ManagedCluster represents a downstream Kubernetes cluster served by the
//! management plane. Ownership of its background controllers is sharded across
//! peers by `metadata.uid`, never by name, so renames do not move a cluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, PROVISIONED_CONDITION};

/// Specification for a ManagedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    plural = "managedclusters",
    shortname = "mc",
    status = "ManagedClusterStatus",
    namespaced = false,
    derive = "PartialEq",
    printcolumn = r#"{"name":"Display","type":"string","jsonPath":".spec.displayName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Human-friendly name shown in the UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Status for a ManagedCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Conditions representing the cluster state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ManagedCluster {
    /// Immutable, globally unique id used as the ownership hashing key
    ///
    /// Empty until the API server has assigned one.
    pub fn uid_or_empty(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    /// Whether deletion has been requested (deletionTimestamp is set)
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the `Provisioned` condition is `True`
    pub fn is_provisioned(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.iter().any(|c| c.is_true(PROVISIONED_CONDITION)))
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Value of an annotation, if set
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Value of a label, if set
    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ConditionStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn sample_cluster(name: &str) -> ManagedCluster {
        ManagedCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("{name}-uid")),
                ..Default::default()
            },
            spec: ManagedClusterSpec::default(),
            status: None,
        }
    }

    #[test]
    fn uid_is_read_from_metadata() {
        let cluster = sample_cluster("prod");
        assert_eq!(cluster.uid_or_empty(), "prod-uid");

        let mut cluster = sample_cluster("new");
        cluster.metadata.uid = None;
        assert_eq!(cluster.uid_or_empty(), "");
    }

    #[test]
    fn deleting_follows_deletion_timestamp() {
        let mut cluster = sample_cluster("prod");
        assert!(!cluster.is_deleting());
        cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(cluster.is_deleting());
    }

    #[test]
    fn provisioned_requires_true_condition() {
        let mut cluster = sample_cluster("prod");
        assert!(!cluster.is_provisioned());

        cluster.status = Some(ManagedClusterStatus {
            conditions: vec![Condition::new(
                PROVISIONED_CONDITION,
                ConditionStatus::False,
                "Waiting",
                "",
            )],
        });
        assert!(!cluster.is_provisioned());

        cluster.status = Some(ManagedClusterStatus {
            conditions: vec![
                Condition::new("Ready", ConditionStatus::True, "", ""),
                Condition::new(PROVISIONED_CONDITION, ConditionStatus::True, "Done", ""),
            ],
        });
        assert!(cluster.is_provisioned());
    }

    #[test]
    fn metadata_lookups() {
        let mut cluster = sample_cluster("prod");
        assert!(!cluster.has_finalizer("a/b"));
        assert_eq!(cluster.annotation("k"), None);

        cluster.metadata.finalizers = Some(vec!["a/b".to_string()]);
        cluster.metadata.annotations = Some(BTreeMap::from([("k".to_string(), "v".to_string())]));
        cluster.metadata.labels = Some(BTreeMap::from([("l".to_string(), "w".to_string())]));

        assert!(cluster.has_finalizer("a/b"));
        assert_eq!(cluster.annotation("k"), Some("v"));
        assert_eq!(cluster.label("l"), Some("w"));
        assert_eq!(cluster.label("k"), None);
    }

    #[test]
    fn crd_schema_types_condition_timestamps() {
        use kube::CustomResourceExt;

        let crd = serde_json::to_value(ManagedCluster::crd()).unwrap();
        let condition = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]
            ["status"]["properties"]["conditions"]["items"]["properties"];
        assert_eq!(condition["lastTransitionTime"]["type"], "string");
        assert_eq!(condition["lastTransitionTime"]["format"], "date-time");
        assert_eq!(crd["spec"]["scope"], "Cluster");
    }
}
