//! Matching the number of instances in each set to the spec
//!
//! Scaling up produces the runner and data volume of every instance a set
//! should have. Scaling down works across the whole cluster, because which
//! set holds the primary is only known from what was observed.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use once_cell::sync::OnceCell;
use pgfleet_models::{InstanceSetSpec, PostgresCluster, PostgresClusterSpec, PostgresClusterStatus};
use tera::{Context as TeraContext, Tera};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::instance::{by_priority, label, Instance, ObservedInstances};
use crate::naming;
use crate::platform::Platform;

pub const DEFAULT_IMAGE: &str = "ghcr.io/zalando/spilo-16:3.3-p3";
pub const DEFAULT_PORT: i32 = 5432;

const RUNNER_TEMPLATE: &str = "instance-statefulset.yaml";
const VOLUME_TEMPLATE: &str = "instance-pgdata.yaml";
const ACCOUNT_TEMPLATE: &str = "patroni-serviceaccount.yaml";
const ROLE_TEMPLATE: &str = "patroni-role.yaml";
const ROLE_BINDING_TEMPLATE: &str = "patroni-rolebinding.yaml";

static TEMPLATES: OnceCell<Tera> = OnceCell::new();

fn templates() -> Result<&'static Tera> {
    TEMPLATES.get_or_try_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (
                RUNNER_TEMPLATE,
                include_str!("../templates/instance-statefulset.yaml"),
            ),
            (VOLUME_TEMPLATE, include_str!("../templates/instance-pgdata.yaml")),
            (
                ACCOUNT_TEMPLATE,
                include_str!("../templates/patroni-serviceaccount.yaml"),
            ),
            (ROLE_TEMPLATE, include_str!("../templates/patroni-role.yaml")),
            (
                ROLE_BINDING_TEMPLATE,
                include_str!("../templates/patroni-rolebinding.yaml"),
            ),
        ])
        .map_err(|source| Error::Template {
            name: "instance templates",
            source,
        })?;
        Ok(tera)
    })
}

/// The objects to apply for one instance.
#[derive(Clone, Debug)]
pub struct InstanceIntent {
    pub name: String,
    pub runner: StatefulSet,
    pub data_volume: PersistentVolumeClaim,
}

/// The identity instance Pods run as. Patroni needs it to keep its state
/// in the Kubernetes API.
#[derive(Clone, Debug)]
pub struct PatroniAccess {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub role_binding: RoleBinding,
}

/// Renders the ServiceAccount, Role and RoleBinding shared by every
/// instance of `cluster`.
pub fn patroni_access(cluster: &PostgresCluster) -> Result<PatroniAccess> {
    let owner = controller_owner(cluster)?;
    let cluster_name = cluster.name_any();

    let mut ctx = TeraContext::new();
    ctx.insert("namespace", &cluster.namespace().unwrap_or_default());
    ctx.insert("cluster", &cluster_name);
    ctx.insert("account", &naming::instance_service_account(&cluster_name));

    let tera = templates()?;
    let mut access = PatroniAccess {
        service_account: render(tera, ACCOUNT_TEMPLATE, &ctx)?,
        role: render(tera, ROLE_TEMPLATE, &ctx)?,
        role_binding: render(tera, ROLE_BINDING_TEMPLATE, &ctx)?,
    };
    access.service_account.metadata.owner_references = Some(vec![owner.clone()]);
    access.role.metadata.owner_references = Some(vec![owner.clone()]);
    access.role_binding.metadata.owner_references = Some(vec![owner]);
    Ok(access)
}

fn controller_owner(cluster: &PostgresCluster) -> Result<OwnerReference> {
    cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvariantViolation(format!("cluster {} has no uid", cluster.name_any()))
    })
}

/// Replicas for the runner of `instance`.
///
/// Nothing runs during a shutdown. When starting back up, only the startup
/// instance runs until a primary is elected.
pub fn runner_replicas(
    spec: &PostgresClusterSpec,
    status: &PostgresClusterStatus,
    instance: &str,
) -> i32 {
    if spec.is_shutdown() {
        return 0;
    }
    match status.startup_instance.as_deref() {
        Some(startup) if startup != instance => 0,
        _ => 1,
    }
}

/// Renders the runner and data volume of `instance` in `set`.
pub fn instance_intent(
    cluster: &PostgresCluster,
    status: &PostgresClusterStatus,
    set: &InstanceSetSpec,
    instance: &str,
) -> Result<InstanceIntent> {
    let cluster_name = cluster.name_any();
    let owner = controller_owner(cluster)?;

    let image = set
        .image
        .as_deref()
        .or(cluster.spec.image.as_deref())
        .unwrap_or(DEFAULT_IMAGE);
    let volume = naming::instance_data_volume(instance);

    let mut ctx = TeraContext::new();
    ctx.insert("name", instance);
    ctx.insert("namespace", &cluster.namespace().unwrap_or_default());
    ctx.insert("cluster", &cluster_name);
    ctx.insert("set", &set.name);
    ctx.insert("replicas", &runner_replicas(&cluster.spec, status, instance));
    ctx.insert("image", image);
    ctx.insert("port", &cluster.spec.port.unwrap_or(DEFAULT_PORT));
    ctx.insert("scope", &naming::patroni_scope(&cluster_name));
    ctx.insert("account", &naming::instance_service_account(&cluster_name));
    ctx.insert("volume", &volume);
    ctx.insert("storage_size_gb", &set.storage_size_gb);

    let tera = templates()?;
    let mut runner: StatefulSet = render(tera, RUNNER_TEMPLATE, &ctx)?;
    let mut data_volume: PersistentVolumeClaim = render(tera, VOLUME_TEMPLATE, &ctx)?;

    runner.metadata.owner_references = Some(vec![owner.clone()]);
    data_volume.metadata.owner_references = Some(vec![owner]);

    Ok(InstanceIntent {
        name: instance.to_string(),
        runner,
        data_volume,
    })
}

fn render<T: serde::de::DeserializeOwned>(
    tera: &Tera,
    name: &'static str,
    ctx: &TeraContext,
) -> Result<T> {
    let yaml = tera
        .render(name, ctx)
        .map_err(|source| Error::Template { name, source })?;
    serde_yaml::from_str(&yaml).map_err(|source| Error::Yaml { name, source })
}

/// Instances of `set` whose data volume is still present but which have no
/// runner, sorted by name.
fn detached_volume_instances(
    cluster_name: &str,
    set: &str,
    observed: &ObservedInstances,
    volumes: &[PersistentVolumeClaim],
) -> VecDeque<String> {
    let names: BTreeSet<String> = volumes
        .iter()
        .filter(|v| v.metadata.deletion_timestamp.is_none())
        .filter(|v| label(&v.metadata, naming::LABEL_CLUSTER) == Some(cluster_name))
        .filter(|v| label(&v.metadata, naming::LABEL_INSTANCE_SET) == Some(set))
        .filter(|v| label(&v.metadata, naming::LABEL_ROLE) == Some(naming::ROLE_POSTGRES_DATA))
        .filter_map(|v| label(&v.metadata, naming::LABEL_INSTANCE))
        .filter(|name| observed.by_name(name).map_or(true, |i| i.runner.is_none()))
        .map(str::to_string)
        .collect();
    names.into_iter().collect()
}

/// Intents for every instance `set` should have: those with a runner
/// today, plus new ones until the set has as many as it declares.
///
/// New instances take the name of a detached data volume of the set when
/// there is one, so that its data is reattached.
pub fn scale_up_instances(
    cluster: &PostgresCluster,
    status: &PostgresClusterStatus,
    set: &InstanceSetSpec,
    observed: &ObservedInstances,
    volumes: &[PersistentVolumeClaim],
) -> Result<Vec<InstanceIntent>> {
    let cluster_name = cluster.name_any();
    let mut names: Vec<String> = observed
        .by_set(&set.name)
        .filter(|i| i.runner.is_some())
        .map(|i| i.name.clone())
        .collect();

    let mut detached = detached_volume_instances(&cluster_name, &set.name, observed, volumes);
    while (names.len() as i32) < set.replicas {
        let name = match detached.pop_front() {
            Some(name) => {
                info!(instance = %name, set = %set.name, "reusing detached data volume");
                name
            }
            None => loop {
                let name = naming::generate_instance(&cluster_name, &set.name);
                if observed.by_name(&name).is_none() && !names.contains(&name) {
                    info!(instance = %name, set = %set.name, "adding instance");
                    break name;
                }
            },
        };
        names.push(name);
    }

    names
        .iter()
        .map(|name| instance_intent(cluster, status, set, name))
        .collect()
}

/// Pods to keep when each set may have at most `want[set]` instances.
///
/// In each set the primary is kept first when the set still wants one, then
/// other pods in the order given.
pub fn pods_to_keep<'a>(
    pods: impl IntoIterator<Item = &'a Pod>,
    want: &BTreeMap<String, i32>,
) -> Vec<&'a Pod> {
    let pods: Vec<&Pod> = pods.into_iter().collect();
    let mut keep = Vec::new();

    for (set, &count) in want {
        let (primaries, others): (Vec<&Pod>, Vec<&Pod>) = pods
            .iter()
            .copied()
            .filter(|p| label(&p.metadata, naming::LABEL_INSTANCE_SET) == Some(set.as_str()))
            .partition(|p| {
                label(&p.metadata, naming::LABEL_ROLE) == Some(naming::ROLE_PATRONI_LEADER)
            });

        let mut kept = Vec::new();
        if count > 0 {
            kept.extend(primaries);
        }
        for pod in others {
            if kept.len() as i32 >= count {
                break;
            }
            kept.push(pod);
        }
        keep.extend(kept);
    }
    keep
}

/// Deletes instances that no longer fit in their set, or whose set left
/// the spec. Returns the deleted instance names.
///
/// Removing the set of the primary, or scaling it to zero, deletes the
/// primary too. The first failed deletion stops the rest.
pub async fn scale_down_instances(
    spec: &PostgresClusterSpec,
    observed: &ObservedInstances,
    platform: &dyn Platform,
) -> Result<Vec<String>> {
    let want: BTreeMap<String, i32> = spec
        .instances
        .iter()
        .map(|set| (set.name.clone(), set.replicas.max(0)))
        .collect();

    // Most valuable first, so those are the ones kept.
    let mut instances: Vec<&Instance> = observed.for_cluster().iter().collect();
    instances.sort_by(|a, b| by_priority(b, a));
    let pods: Vec<&Pod> = instances.iter().flat_map(|i| i.pods.iter()).collect();

    let keep: HashSet<&str> = pods_to_keep(pods.iter().copied(), &want)
        .into_iter()
        .filter_map(|p| p.metadata.name.as_deref())
        .collect();

    let mut deleted: Vec<String> = Vec::new();
    for pod in pods {
        if pod.metadata.name.as_deref().is_some_and(|name| keep.contains(name)) {
            continue;
        }
        let Some(instance) = label(&pod.metadata, naming::LABEL_INSTANCE) else {
            continue;
        };
        if deleted.iter().any(|d| d == instance) {
            continue;
        }

        info!(instance, "deleting instance");
        platform.delete_instance(instance).await?;
        deleted.push(instance.to_string());
    }
    Ok(deleted)
}

/// Stops the cluster one step at a time: replicas and Pods without a role
/// first, the primary only once it is the last Pod. Returns true when no
/// Pods remain.
pub async fn stop_instances(observed: &ObservedInstances, platform: &dyn Platform) -> Result<bool> {
    let running: Vec<&Instance> = observed
        .for_cluster()
        .iter()
        .filter(|i| !i.pods.is_empty())
        .collect();

    let to_stop: Vec<&Instance> = match running.as_slice() {
        [] => return Ok(true),
        [only] => vec![*only],
        _ => running
            .iter()
            .copied()
            .filter(|i| i.is_primary() != Some(true))
            .collect(),
    };

    for instance in to_stop {
        let replicas = instance
            .runner
            .as_ref()
            .and_then(|r| r.spec.as_ref())
            .and_then(|s| s.replicas);
        if replicas == Some(0) {
            debug!(instance = %instance.name, "already stopping");
            continue;
        }

        info!(instance = %instance.name, "stopping instance");
        platform.scale_runner(&instance.name, 0).await?;
    }
    Ok(false)
}
