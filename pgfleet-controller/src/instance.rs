//! Observed instances of one cluster and the questions we ask about them
//!
//! An [`Instance`] is built fresh on every pass from StatefulSets and Pods.
//! Its predicates return `Option<bool>`: `None` means the answer cannot be
//! known from what was observed, and callers must choose what to do about it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pgfleet_models::{InstanceSetSpec, InstanceSetStatus, PostgresClusterSpec};
use serde::Deserialize;
use tracing::warn;

use crate::naming;

/// Value of label `key` on an object, if present.
pub(crate) fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}

/// Value of annotation `key` on an object, if present.
pub(crate) fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref()?.get(key).map(String::as_str)
}

/// A single PostgreSQL instance of a cluster.
#[derive(Clone, Debug, Default)]
pub struct Instance {
    pub name: String,
    /// Pods of this instance. There is exactly one when converged.
    pub pods: Vec<Pod>,
    /// The StatefulSet keeping the Pod alive, absent while it is deleted
    pub runner: Option<StatefulSet>,
    /// The set this instance belongs to, absent when the set left the spec
    pub spec: Option<InstanceSetSpec>,
}

/// Subset of the JSON Patroni writes to the "status" annotation of a Pod.
#[derive(Deserialize)]
struct PatroniMemberStatus {
    role: Option<String>,
}

impl Instance {
    fn pod(&self) -> Option<&Pod> {
        match self.pods.as_slice() {
            [pod] => Some(pod),
            _ => None,
        }
    }

    /// Whether this instance can serve: ready and not terminating. Combines
    /// metadata and status like "available" in a Deployment.
    pub fn is_available(&self) -> Option<bool> {
        let terminating = self.is_terminating()?;
        let ready = self.is_ready()?;
        Some(ready && !terminating)
    }

    /// Whether this instance is the Patroni leader.
    pub fn is_primary(&self) -> Option<bool> {
        let pod = self.pod()?;
        Some(label(&pod.metadata, naming::LABEL_ROLE) == Some(naming::ROLE_PATRONI_LEADER))
    }

    /// Whether this instance is ready to receive PostgreSQL connections.
    pub fn is_ready(&self) -> Option<bool> {
        let conditions = self.pod()?.status.as_ref()?.conditions.as_ref()?;
        conditions
            .iter()
            .find(|condition| condition.type_ == "Ready")
            .map(|condition| condition.status == "True")
    }

    /// Whether `container` is running. Init containers are considered too.
    pub fn is_running(&self, container: &str) -> Option<bool> {
        let status = self.pod()?.status.as_ref()?;
        status
            .container_statuses
            .iter()
            .chain(status.init_container_statuses.iter())
            .flatten()
            .find(|s| s.name == container)
            .map(|s| s.state.as_ref().is_some_and(|state| state.running.is_some()))
    }

    /// Whether this instance is in the process of stopping.
    pub fn is_terminating(&self) -> Option<bool> {
        Some(self.pod()?.metadata.deletion_timestamp.is_some())
    }

    /// Whether Patroni reports this instance accepts writes. A missing or
    /// malformed status annotation is unknown, never false.
    pub fn is_writable(&self) -> Option<bool> {
        let status = annotation(&self.pod()?.metadata, naming::ANNOTATION_PATRONI_STATUS)?;
        let member: PatroniMemberStatus = serde_json::from_str(status).ok()?;
        let role = member.role?;
        Some(role == "master" || role == "primary")
    }

    /// Whether the Pod matches the current PodTemplate of its StatefulSet.
    /// When it does not, the Pod needs to be redeployed.
    pub fn pod_matches_pod_template(&self) -> Option<bool> {
        let runner = self.runner.as_ref()?;
        let pod = self.pod()?;
        let status = runner.status.as_ref();

        // Until the StatefulSet controller processes the latest template,
        // its update revision is stale.
        if status.and_then(|s| s.observed_generation) != runner.metadata.generation {
            return None;
        }

        let pod_revision = label(&pod.metadata, naming::LABEL_POD_TEMPLATE_REVISION);
        Some(pod_revision == status.and_then(|s| s.update_revision.as_deref()))
    }

    /// Name of the set this instance was observed in.
    pub fn set_name(&self) -> Option<&str> {
        if let Some(spec) = &self.spec {
            return Some(&spec.name);
        }
        self.runner
            .as_ref()
            .and_then(|r| label(&r.metadata, naming::LABEL_INSTANCE_SET))
            .or_else(|| {
                self.pods
                    .first()
                    .and_then(|p| label(&p.metadata, naming::LABEL_INSTANCE_SET))
            })
    }
}

/// Orders instances by how much we want each to keep running, lowest first.
///
/// The primary, when known, is the highest priority. Among the rest an
/// available instance outranks one that is not. Remaining ties go by name.
pub fn by_priority(a: &Instance, b: &Instance) -> Ordering {
    fn rank(instance: &Instance) -> u8 {
        if instance.is_primary() == Some(true) {
            2
        } else if instance.is_available() == Some(true) {
            1
        } else {
            0
        }
    }

    rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
}

/// All the PostgreSQL instances of a single cluster.
#[derive(Debug, Default)]
pub struct ObservedInstances {
    instances: Vec<Instance>,
    by_name: HashMap<String, usize>,
    by_set: BTreeMap<String, Vec<usize>>,
    set_names: BTreeSet<String>,
}

impl ObservedInstances {
    /// Builds the snapshot from StatefulSets and Pods, in any order. A Pod
    /// without a StatefulSet and a StatefulSet without a Pod are both valid.
    pub fn new(spec: &PostgresClusterSpec, runners: Vec<StatefulSet>, pods: Vec<Pod>) -> Self {
        let mut observed = Self::default();
        for set in &spec.instances {
            observed.set_names.insert(set.name.clone());
        }

        for runner in runners {
            let Some(name) = runner.metadata.name.clone() else {
                continue;
            };
            let set = label(&runner.metadata, naming::LABEL_INSTANCE_SET)
                .unwrap_or_default()
                .to_string();

            let index = observed.fetch_or_insert(spec, &name, &set);
            observed.instances[index].runner = Some(runner);
        }

        for pod in pods {
            let Some(name) = label(&pod.metadata, naming::LABEL_INSTANCE).map(str::to_string)
            else {
                warn!(pod = ?pod.metadata.name, "pod has no instance label");
                continue;
            };
            let set = label(&pod.metadata, naming::LABEL_INSTANCE_SET)
                .unwrap_or_default()
                .to_string();

            let index = observed.fetch_or_insert(spec, &name, &set);
            observed.instances[index].pods.push(pod);
        }

        observed
    }

    fn fetch_or_insert(&mut self, spec: &PostgresClusterSpec, name: &str, set: &str) -> usize {
        if let Some(&index) = self.by_name.get(name) {
            return index;
        }

        let index = self.instances.len();
        self.instances.push(Instance {
            name: name.to_string(),
            spec: spec.instance_set(set).cloned(),
            ..Instance::default()
        });
        self.by_name.insert(name.to_string(), index);
        self.by_set.entry(set.to_string()).or_default().push(index);
        self.set_names.insert(set.to_string());
        index
    }

    /// Every instance, in the order first observed.
    pub fn for_cluster(&self) -> &[Instance] {
        &self.instances
    }

    pub fn by_name(&self, name: &str) -> Option<&Instance> {
        self.by_name.get(name).map(|&i| &self.instances[i])
    }

    pub fn by_set<'a>(&'a self, set: &str) -> impl Iterator<Item = &'a Instance> + 'a {
        self.by_set
            .get(set)
            .into_iter()
            .flatten()
            .map(|&i| &self.instances[i])
    }

    /// Names of sets in the spec or observed, sorted.
    pub fn set_names(&self) -> impl Iterator<Item = &str> {
        self.set_names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// The instance known to be the Patroni leader, if any.
    pub fn primary(&self) -> Option<&Instance> {
        self.instances.iter().find(|i| i.is_primary() == Some(true))
    }

    /// Replica counts of every set, sorted by set name.
    pub fn set_statuses(&self) -> Vec<InstanceSetStatus> {
        self.set_names()
            .map(|name| {
                let mut status = InstanceSetStatus {
                    name: name.to_string(),
                    ..InstanceSetStatus::default()
                };
                for instance in self.by_set(name) {
                    if instance.is_ready() == Some(true) {
                        status.ready_replicas += 1;
                    }
                    if instance.is_terminating() == Some(false) {
                        status.replicas += 1;
                        if instance.pod_matches_pod_template() == Some(true) {
                            status.updated_replicas += 1;
                        }
                    }
                }
                status
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::collections::BTreeMap;

    /// A Pod of `instance` in `set`, ready or not, with an optional role.
    pub(crate) fn pod(instance: &str, set: &str, ready: bool, role: Option<&str>) -> Pod {
        let mut labels = BTreeMap::from([
            (naming::LABEL_CLUSTER.to_string(), "hippo".to_string()),
            (naming::LABEL_INSTANCE_SET.to_string(), set.to_string()),
            (naming::LABEL_INSTANCE.to_string(), instance.to_string()),
            (naming::LABEL_POD_TEMPLATE_REVISION.to_string(), "rev-1".to_string()),
        ]);
        if let Some(role) = role {
            labels.insert(naming::LABEL_ROLE.to_string(), role.to_string());
        }

        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-0", instance)),
                namespace: Some("ns".to_string()),
                uid: Some(format!("uid-{}", instance)),
                resource_version: Some("1".to_string()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..PodCondition::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: naming::CONTAINER_DATABASE.to_string(),
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..ContainerState::default()
                    }),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    /// A StatefulSet for `instance` in `set` whose update revision is `revision`.
    pub(crate) fn runner(instance: &str, set: &str, revision: &str) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(instance.to_string()),
                generation: Some(1),
                labels: Some(BTreeMap::from([
                    (naming::LABEL_CLUSTER.to_string(), "hippo".to_string()),
                    (naming::LABEL_INSTANCE_SET.to_string(), set.to_string()),
                    (naming::LABEL_INSTANCE.to_string(), instance.to_string()),
                ])),
                ..ObjectMeta::default()
            },
            status: Some(StatefulSetStatus {
                observed_generation: Some(1),
                update_revision: Some(revision.to_string()),
                ..StatefulSetStatus::default()
            }),
            ..StatefulSet::default()
        }
    }

    pub(crate) fn spec(sets: &[(&str, i32)]) -> PostgresClusterSpec {
        PostgresClusterSpec {
            instances: sets
                .iter()
                .map(|(name, replicas)| InstanceSetSpec {
                    name: name.to_string(),
                    replicas: *replicas,
                    ..InstanceSetSpec::default()
                })
                .collect(),
            ..PostgresClusterSpec::default()
        }
    }

    fn with_status_annotation(mut pod: Pod, status: &str) -> Pod {
        pod.metadata.annotations = Some(BTreeMap::from([(
            naming::ANNOTATION_PATRONI_STATUS.to_string(),
            status.to_string(),
        )]));
        pod
    }

    #[test]
    fn test_predicates_unknown_without_exactly_one_pod() {
        let mut instance = Instance::default();
        assert_eq!(instance.is_ready(), None);
        assert_eq!(instance.is_primary(), None);
        assert_eq!(instance.is_terminating(), None);
        assert_eq!(instance.is_available(), None);
        assert_eq!(instance.is_writable(), None);
        assert_eq!(instance.is_running(naming::CONTAINER_DATABASE), None);

        instance.pods = vec![
            pod("a", "daisy", true, Some(naming::ROLE_PATRONI_LEADER)),
            pod("a", "daisy", true, None),
        ];
        instance.runner = Some(runner("a", "daisy", "rev-1"));
        assert_eq!(instance.is_ready(), None);
        assert_eq!(instance.is_primary(), None);
        assert_eq!(instance.pod_matches_pod_template(), None);
    }

    #[test]
    fn test_is_ready_and_available() {
        let mut instance = Instance {
            pods: vec![Pod::default()],
            ..Instance::default()
        };
        // No conditions
        assert_eq!(instance.is_ready(), None);
        assert_eq!(instance.is_available(), None);

        instance.pods = vec![pod("a", "daisy", false, None)];
        assert_eq!(instance.is_ready(), Some(false));
        assert_eq!(instance.is_available(), Some(false));

        instance.pods = vec![pod("a", "daisy", true, None)];
        assert_eq!(instance.is_available(), Some(true));

        instance.pods[0].metadata.deletion_timestamp = Some(Time(Default::default()));
        assert_eq!(instance.is_terminating(), Some(true));
        assert_eq!(instance.is_available(), Some(false));
    }

    #[test]
    fn test_is_running() {
        let mut instance = Instance {
            pods: vec![Pod::default()],
            ..Instance::default()
        };
        assert_eq!(instance.is_running("any"), None);

        instance.pods[0].status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "c1".to_string(),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        });
        assert_eq!(instance.is_running("c1"), Some(false));
        assert_eq!(instance.is_running("missing"), None);

        let status = instance.pods[0].status.as_mut().unwrap();
        status.container_statuses.as_mut().unwrap()[0].state = Some(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        });
        status.init_container_statuses = Some(vec![ContainerStatus {
            name: "i1".to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..ContainerState::default()
            }),
            ..ContainerStatus::default()
        }]);
        assert_eq!(instance.is_running("c1"), Some(true));
        assert_eq!(instance.is_running("i1"), Some(true));
    }

    #[test]
    fn test_is_writable() {
        let base = pod("a", "daisy", true, None);
        let mut instance = Instance {
            pods: vec![base.clone()],
            ..Instance::default()
        };
        // No annotations
        assert_eq!(instance.is_writable(), None);

        for (status, expected) in [
            ("{}", None),
            ("not json", None),
            (r#"{"role": 7}"#, None),
            (r#"{"role":"master"}"#, Some(true)),
            (r#"{"role":"replica"}"#, Some(false)),
            (r#"{"role":"standby_leader"}"#, Some(false)),
        ] {
            instance.pods = vec![with_status_annotation(base.clone(), status)];
            assert_eq!(instance.is_writable(), expected, "status {}", status);
        }
    }

    #[test]
    fn test_pod_matches_pod_template() {
        let mut instance = Instance {
            name: "a".to_string(),
            pods: vec![pod("a", "daisy", true, None)],
            runner: None,
            spec: None,
        };
        assert_eq!(instance.pod_matches_pod_template(), None);

        instance.runner = Some(runner("a", "daisy", "rev-1"));
        assert_eq!(instance.pod_matches_pod_template(), Some(true));

        instance.runner = Some(runner("a", "daisy", "rev-2"));
        assert_eq!(instance.pod_matches_pod_template(), Some(false));

        // The controller has not seen the latest template yet.
        instance.runner.as_mut().unwrap().metadata.generation = Some(2);
        assert_eq!(instance.pod_matches_pod_template(), None);
    }

    #[test]
    fn test_by_priority() {
        let primary = Instance {
            name: "a-primary".to_string(),
            pods: vec![pod("a-primary", "daisy", false, Some(naming::ROLE_PATRONI_LEADER))],
            ..Instance::default()
        };
        let available = Instance {
            name: "b-available".to_string(),
            pods: vec![pod("b-available", "daisy", true, Some(naming::ROLE_PATRONI_REPLICA))],
            ..Instance::default()
        };
        let unavailable = Instance {
            name: "c-unavailable".to_string(),
            pods: vec![pod("c-unavailable", "daisy", false, None)],
            ..Instance::default()
        };
        let unknown = Instance {
            name: "d-unknown".to_string(),
            ..Instance::default()
        };

        let mut instances = vec![primary, available, unavailable, unknown];
        instances.sort_by(by_priority);
        let names: Vec<_> = instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            ["c-unavailable", "d-unknown", "b-available", "a-primary"]
        );
    }

    #[test]
    fn test_new_observed_instances_empty() {
        let observed = ObservedInstances::new(&PostgresClusterSpec::default(), vec![], vec![]);
        assert!(observed.is_empty());
        assert_eq!(observed.set_names().count(), 0);
    }

    #[test]
    fn test_new_observed_instances_pod_missing_others() {
        let observed = ObservedInstances::new(
            &PostgresClusterSpec::default(),
            vec![],
            vec![pod("the-name", "missing", true, None)],
        );

        assert_eq!(observed.len(), 1);
        let instance = &observed.for_cluster()[0];
        assert_eq!(instance.name, "the-name");
        assert_eq!(instance.pods.len(), 1);
        assert!(instance.runner.is_none());
        assert!(instance.spec.is_none());
        assert_eq!(instance.set_name(), Some("missing"));

        assert_eq!(observed.by_name("the-name").unwrap().name, "the-name");
        assert_eq!(observed.by_set("missing").count(), 1);
        assert_eq!(observed.set_names().collect::<Vec<_>>(), ["missing"]);
    }

    #[test]
    fn test_new_observed_instances_runner_and_pods_any_order() {
        let spec = spec(&[("daisy", 2), ("rose", 1)]);
        let observed = ObservedInstances::new(
            &spec,
            vec![runner("d1", "daisy", "rev-1"), runner("gone", "old", "rev-1")],
            vec![
                pod("r1", "rose", true, None),
                pod("d1", "daisy", true, Some(naming::ROLE_PATRONI_LEADER)),
            ],
        );

        assert_eq!(observed.len(), 3);
        let names: Vec<_> = observed.for_cluster().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["d1", "gone", "r1"]);

        let d1 = observed.by_name("d1").unwrap();
        assert!(d1.runner.is_some());
        assert_eq!(d1.pods.len(), 1);
        assert_eq!(d1.spec.as_ref().unwrap().name, "daisy");

        // Orphan: its set is no longer in the spec.
        assert!(observed.by_name("gone").unwrap().spec.is_none());
        assert!(observed.by_name("r1").unwrap().runner.is_none());

        assert_eq!(
            observed.set_names().collect::<Vec<_>>(),
            ["daisy", "old", "rose"]
        );
        assert_eq!(observed.primary().unwrap().name, "d1");
    }

    #[test]
    fn test_set_statuses() {
        let spec = spec(&[("daisy", 2)]);
        let mut terminating = pod("d2", "daisy", true, None);
        terminating.metadata.deletion_timestamp = Some(Time(Default::default()));

        let observed = ObservedInstances::new(
            &spec,
            vec![runner("d1", "daisy", "rev-1"), runner("d2", "daisy", "rev-1")],
            vec![pod("d1", "daisy", true, None), terminating],
        );

        assert_eq!(
            observed.set_statuses(),
            vec![InstanceSetStatus {
                name: "daisy".to_string(),
                replicas: 1,
                ready_replicas: 2,
                updated_replicas: 1,
            }]
        );
    }
}
