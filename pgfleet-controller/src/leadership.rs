//! Patroni restarts, requested switchovers and the startup instance
//!
//! Every decision here comes from observed facts: Pod annotations, the
//! Patroni timeline and what is recorded in the cluster status. Running the
//! same pass twice never sends a command twice.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use pgfleet_models::{PatroniStatus, PostgresCluster, PostgresClusterStatus, SwitchoverType};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::instance::{annotation, ObservedInstances};
use crate::naming;
use crate::patroni::{pod_requires_restart, ContainerRef, PatroniCtl, PodExec};

/// Restarts Patroni members with a pending restart, at most one command per
/// pass. The primary goes first so that settings it depends on are in
/// effect before replicas restart. Returns the role that was restarted.
pub async fn handle_patroni_restarts(
    cluster_name: &str,
    observed: &ObservedInstances,
    exec: &dyn PodExec,
) -> Result<Option<&'static str>> {
    let mut primary: Option<&Pod> = None;
    let mut replica: Option<&Pod> = None;

    for instance in observed.for_cluster() {
        if instance.is_terminating() != Some(false)
            || instance.is_running(naming::CONTAINER_DATABASE) != Some(true)
        {
            continue;
        }
        let [pod] = instance.pods.as_slice() else {
            continue;
        };
        if !pod_requires_restart(pod) {
            continue;
        }

        if instance.is_primary() == Some(true) {
            primary = Some(pod);
        } else {
            replica.get_or_insert(pod);
        }
    }

    let (pod, role) = match (primary, replica) {
        (Some(pod), _) => (pod, naming::ROLE_PATRONI_LEADER),
        (None, Some(pod)) => (pod, naming::ROLE_PATRONI_REPLICA),
        (None, None) => return Ok(None),
    };

    info!(pod = ?pod.metadata.name, role, "restarting pending Patroni members");
    PatroniCtl::new(exec, ContainerRef::database(pod))
        .restart_pending_members(role, &naming::patroni_scope(cluster_name))
        .await?;
    Ok(Some(role))
}

/// Where a requested switchover stands after one pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchoverState {
    /// Switchovers are not enabled for the cluster
    Disabled,
    /// Nothing requested, or the request already completed
    Idle,
    /// The timeline was recorded; the command goes out next pass
    TimelineRecorded(i64),
    /// The timeline moved since it was recorded, so the change happened
    AlreadyChanged,
    /// The command was sent and Patroni changed the leader
    Changed,
}

/// Drives the switchover or failover requested by the trigger annotation.
///
/// A request is the annotation value. It is complete once that value is
/// stored in `status.switchover`. Before sending a command, the current
/// timeline is recorded and the pass ends. The next pass only sends the
/// command if the timeline is unchanged, so a request is never acted on
/// twice.
pub async fn reconcile_patroni_switchover(
    cluster: &PostgresCluster,
    status: &mut PatroniStatus,
    observed: &ObservedInstances,
    exec: &dyn PodExec,
) -> Result<SwitchoverState> {
    let Some(switchover) = cluster.spec.switchover() else {
        status.switchover = None;
        status.switchover_timeline = None;
        return Ok(SwitchoverState::Disabled);
    };

    let requested =
        annotation(&cluster.metadata, naming::SWITCHOVER_ANNOTATION).unwrap_or_default();
    if requested.is_empty() || status.switchover.as_deref() == Some(requested) {
        status.switchover_timeline = None;
        return Ok(SwitchoverState::Idle);
    }

    if observed.len() < 2 {
        return Err(Error::InsufficientInstances(observed.len()));
    }

    let target = match switchover.target_instance.as_deref().filter(|t| !t.is_empty()) {
        Some(name) => {
            let instance = observed.by_name(name).ok_or_else(|| {
                Error::InvalidSwitchover(format!("target instance {} not found", name))
            })?;
            match instance.pods.as_slice() {
                [pod] => pod.metadata.name.clone().unwrap_or_default(),
                pods => {
                    return Err(Error::InvalidSwitchover(format!(
                        "target instance {} has {} pods",
                        name,
                        pods.len()
                    )))
                }
            }
        }
        None if switchover.type_ == SwitchoverType::Failover => {
            return Err(Error::InvalidSwitchover(
                "a target instance is required for failover".to_string(),
            ))
        }
        None => String::new(),
    };

    let host = observed
        .for_cluster()
        .iter()
        .filter(|i| i.is_terminating() == Some(false))
        .filter(|i| i.is_running(naming::CONTAINER_DATABASE) == Some(true))
        .find_map(|i| i.pods.first())
        .ok_or(Error::NoRunningInstance("switchover"))?;
    let patroni = PatroniCtl::new(exec, ContainerRef::database(host));

    let timeline = patroni.get_timeline().await?;
    if timeline == 0 {
        return Err(Error::Timeline("no leader reported".to_string()));
    }

    match status.switchover_timeline {
        None | Some(0) => {
            info!(cluster = %cluster.name_any(), requested, timeline, "recorded timeline before switchover");
            status.switchover_timeline = Some(timeline);
            return Ok(SwitchoverState::TimelineRecorded(timeline));
        }
        Some(recorded) if recorded != timeline => {
            debug!(recorded, timeline, "timeline changed since it was recorded");
            status.switchover = Some(requested.to_string());
            status.switchover_timeline = None;
            return Ok(SwitchoverState::AlreadyChanged);
        }
        Some(_) => {}
    }

    let (action, changed) = match switchover.type_ {
        SwitchoverType::Failover => ("failover", patroni.failover_and_wait(&target).await?),
        SwitchoverType::Switchover => ("switchover", patroni.switchover_and_wait(&target).await?),
    };
    if !changed {
        return Err(Error::LeaderNotChanged(action));
    }

    info!(cluster = %cluster.name_any(), requested, target = %target, action, "leader changed");
    status.switchover = Some(requested.to_string());
    status.switchover_timeline = None;
    Ok(SwitchoverState::Changed)
}

/// Keeps track of the instance that should start first after a shutdown.
///
/// It is the primary at the time a shutdown begins. It is forgotten once a
/// primary is known again while running, or when its instance is gone.
pub fn reconcile_startup_instance(
    cluster: &PostgresCluster,
    status: &mut PostgresClusterStatus,
    observed: &ObservedInstances,
) {
    let primary = observed.primary();

    if cluster.spec.is_shutdown() {
        if status.startup_instance.is_none() {
            if let Some(primary) = primary {
                info!(instance = %primary.name, "recording startup instance");
                status.startup_instance = Some(primary.name.clone());
                status.startup_instance_set = primary.set_name().map(str::to_string);
            }
        }
        return;
    }

    let gone = status
        .startup_instance
        .as_deref()
        .is_some_and(|name| observed.by_name(name).map_or(true, |i| i.runner.is_none()));
    if primary.is_some() || gone {
        status.startup_instance = None;
        status.startup_instance_set = None;
    }
}
