//! Custom resource types for pgfleet-managed PostgreSQL clusters
//!
//! A `PostgresCluster` declares one or more instance sets. Each instance in a
//! set is a single PostgreSQL process kept alive by its own StatefulSet and
//! coordinated by Patroni.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation on a `PostgresCluster` whose value requests a new switchover.
///
/// Any value that differs from `status.patroni.switchover` is a new request.
pub const SWITCHOVER_ANNOTATION: &str = "pgfleet.io/trigger-switchover";

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "pgfleet.io",
    version = "v1beta1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Shutdown", "type":"boolean", "jsonPath":".spec.shutdown"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Instance sets of the cluster. Set names must be unique.
    #[serde(default)]
    pub instances: Vec<InstanceSetSpec>,

    /// Patroni behavior, including requested switchovers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patroni: Option<PatroniSpec>,

    /// Whether or not the PostgreSQL cluster should be stopped.
    /// Services, volumes and other resources remain in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,

    /// Port on which PostgreSQL listens (default: 5432)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Container image for the database container of every instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl PostgresClusterSpec {
    /// Sum of declared replicas across all instance sets.
    pub fn specified_replicas(&self) -> i32 {
        self.instances.iter().map(|set| set.replicas.max(0)).sum()
    }

    /// Find an instance set by name.
    pub fn instance_set(&self, name: &str) -> Option<&InstanceSetSpec> {
        self.instances.iter().find(|set| set.name == name)
    }

    /// Whether the cluster is asked to stop.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.unwrap_or(false)
    }

    /// The enabled switchover settings, if any.
    pub fn switchover(&self) -> Option<&PatroniSwitchover> {
        self.patroni
            .as_ref()
            .and_then(|p| p.switchover.as_ref())
            .filter(|s| s.enabled)
    }
}

/// A named, homogeneously configured group of instances
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetSpec {
    /// Name of the set; part of every instance name in it
    pub name: String,

    /// Number of instances the set should have (default: 1)
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Data volume size in GB (default: 10)
    #[serde(default = "default_storage_size_gb")]
    pub storage_size_gb: i32,

    /// Overrides the cluster image for this set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Default for InstanceSetSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            replicas: default_replicas(),
            storage_size_gb: default_storage_size_gb(),
            image: None,
        }
    }
}

fn default_replicas() -> i32 {
    1
}

fn default_storage_size_gb() -> i32 {
    10
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatroniSpec {
    /// Switchover settings. A switchover is triggered by changing the
    /// `pgfleet.io/trigger-switchover` annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switchover: Option<PatroniSwitchover>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatroniSwitchover {
    /// Whether or not the operator should act on the trigger annotation
    pub enabled: bool,

    /// Instance that should become primary. Required for failover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_instance: Option<String>,

    /// Kind of leadership change (default: Switchover)
    #[serde(default, rename = "type")]
    pub type_: SwitchoverType,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SwitchoverType {
    #[default]
    Switchover,
    Failover,
}

/// Observed state of a PostgresCluster.
///
/// Optional fields serialize as `null` so that a merge patch of the whole
/// status clears them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Per-set replica counts, sorted by set name
    #[serde(default)]
    pub instance_sets: Vec<InstanceSetStatus>,

    #[serde(default)]
    pub patroni: PatroniStatus,

    /// Instance that should start first after a shutdown
    #[serde(default)]
    pub startup_instance: Option<String>,

    /// The instance set associated with the startup instance
    #[serde(default)]
    pub startup_instance_set: Option<String>,

    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    pub name: String,

    /// Instances with a Pod that is not terminating
    pub replicas: i32,

    /// Instances with a ready Pod
    pub ready_replicas: i32,

    /// Instances whose Pod matches their current PodTemplate
    pub updated_replicas: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PatroniStatus {
    /// The last trigger annotation value that completed a switchover
    #[serde(default)]
    pub switchover: Option<String>,

    /// The Patroni timeline recorded when the pending switchover was first seen
    #[serde(default)]
    pub switchover_timeline: Option<i64>,
}

/// Summary of the last reconciliation of one cluster, served by the operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSummary {
    pub namespace: String,
    pub name: String,
    pub instances: usize,
    pub ready: usize,
    pub primary: Option<String>,
    pub reconciled_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Response from listing reconciled clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListClustersResponse {
    pub clusters: Vec<ClusterSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: PostgresClusterSpec = serde_json::from_value(serde_json::json!({
            "instances": [{"name": "daisy"}, {"name": "rose", "replicas": 3}],
        }))
        .unwrap();

        assert_eq!(spec.instances[0].replicas, 1);
        assert_eq!(spec.instances[0].storage_size_gb, 10);
        assert_eq!(spec.specified_replicas(), 4);
        assert!(!spec.is_shutdown());
        assert!(spec.switchover().is_none());
    }

    #[test]
    fn test_switchover_requires_enabled() {
        let mut spec: PostgresClusterSpec = serde_json::from_value(serde_json::json!({
            "patroni": {"switchover": {"enabled": false, "type": "Failover", "targetInstance": "x"}},
        }))
        .unwrap();
        assert!(spec.switchover().is_none());

        spec.patroni.as_mut().unwrap().switchover.as_mut().unwrap().enabled = true;
        let switchover = spec.switchover().unwrap();
        assert_eq!(switchover.type_, SwitchoverType::Failover);
        assert_eq!(switchover.target_instance.as_deref(), Some("x"));
    }

    #[test]
    fn test_status_clears_with_nulls() {
        let status = PostgresClusterStatus::default();
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(value["patroni"]["switchover"], serde_json::Value::Null);
        assert!(value["patroni"].as_object().unwrap().contains_key("switchoverTimeline"));
        assert!(value.as_object().unwrap().contains_key("startupInstance"));
    }
}
