//! One reconciliation pass over a PostgresCluster
//!
//! Every step acts on the same snapshot, taken at the start of the pass.

use kube::ResourceExt;
use pgfleet_models::{PostgresCluster, PostgresClusterStatus};
use tracing::{debug, info};

use crate::error::Result;
use crate::instance::ObservedInstances;
use crate::leadership::{
    handle_patroni_restarts, reconcile_patroni_switchover, reconcile_startup_instance,
};
use crate::naming;
use crate::patroni::PodExec;
use crate::platform::Platform;
use crate::rollout::{rollout_instances, PodRedeployer};
use crate::scale::{patroni_access, scale_down_instances, scale_up_instances, stop_instances};

/// What a pass observed and whether it left work for a later one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub instances: usize,
    pub ready: usize,
    pub primary: Option<String>,
    /// Set when the pass stopped early and should run again soon
    pub requeue: bool,
}

/// Reconciles the instances of `cluster` and writes back its status.
///
/// The status is written even when a step fails, so bookkeeping done
/// before the failure is kept.
pub async fn reconcile_cluster(
    cluster: &PostgresCluster,
    platform: &dyn Platform,
    exec: &dyn PodExec,
) -> Result<PassSummary> {
    let name = cluster.name_any();
    let selector = naming::cluster_instances(&name);
    let runners = platform.list_runners(&selector).await?;
    let pods = platform.list_pods(&selector).await?;
    let observed = ObservedInstances::new(&cluster.spec, runners, pods);

    let original = cluster.status.clone().unwrap_or_default();
    let mut status = original.clone();
    status.instance_sets = observed.set_statuses();
    status.observed_generation = cluster.metadata.generation;
    reconcile_startup_instance(cluster, &mut status, &observed);

    let result = reconcile_instances(cluster, &mut status, &observed, platform, exec).await;

    let written = if status != original {
        debug!(cluster = %name, "writing status");
        platform.write_status(&status).await
    } else {
        Ok(())
    };
    let requeue = result?;
    written?;

    Ok(PassSummary {
        instances: observed.len(),
        ready: observed
            .for_cluster()
            .iter()
            .filter(|i| i.is_ready() == Some(true))
            .count(),
        primary: observed.primary().map(|i| i.name.clone()),
        requeue,
    })
}

async fn reconcile_instances(
    cluster: &PostgresCluster,
    status: &mut PostgresClusterStatus,
    observed: &ObservedInstances,
    platform: &dyn Platform,
    exec: &dyn PodExec,
) -> Result<bool> {
    let name = cluster.name_any();
    let mut requeue = false;

    if cluster.spec.is_shutdown() {
        requeue = !stop_instances(observed, platform).await?;
    } else {
        let volumes = platform
            .list_volumes(&naming::cluster_data_volumes(&name))
            .await?;
        platform.apply_access(&patroni_access(cluster)?).await?;
        for set in &cluster.spec.instances {
            for intent in scale_up_instances(cluster, status, set, observed, &volumes)? {
                platform.apply_volume(&intent.data_volume).await?;
                platform.apply_runner(&intent.runner).await?;
            }
        }

        let deleted = scale_down_instances(&cluster.spec, observed, platform).await?;
        if deleted.is_empty() {
            let redeployer = PodRedeployer {
                platform,
                exec,
                observed,
            };
            let redeployed = rollout_instances(&cluster.spec, observed, &redeployer).await?;
            if !redeployed.is_empty() {
                info!(cluster = %name, ?redeployed, "rolled out instances");
            }
        } else {
            // The snapshot still holds the deleted instances.
            requeue = true;
        }
    }

    handle_patroni_restarts(&name, observed, exec).await?;

    if let Err(e) = reconcile_patroni_switchover(cluster, &mut status.patroni, observed, exec).await
    {
        platform.publish_warning(e.reason(), e.to_string()).await;
        return Err(e);
    }
    Ok(requeue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::instance::tests::{pod, runner, spec};
    use crate::patroni::tests::FakeExec;
    use crate::platform::tests::FakePlatform;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use pgfleet_models::{PatroniSpec, PatroniSwitchover, PostgresClusterSpec};
    use std::collections::BTreeMap;

    fn cluster(spec: PostgresClusterSpec) -> PostgresCluster {
        let mut cluster = PostgresCluster::new("hippo", spec);
        cluster.metadata.namespace = Some("ns".to_string());
        cluster.metadata.uid = Some("cluster-uid".to_string());
        cluster.metadata.generation = Some(3);
        cluster
    }

    fn running(name: &str) -> k8s_openapi::api::apps::v1::StatefulSet {
        let mut runner = runner(name, "daisy", "rev-1");
        runner.spec = Some(StatefulSetSpec {
            replicas: Some(1),
            ..StatefulSetSpec::default()
        });
        runner
    }

    #[tokio::test]
    async fn test_new_cluster_creates_instances() {
        let cluster = cluster(spec(&[("daisy", 2)]));
        let platform = FakePlatform::default();
        let exec = FakeExec::default();

        let summary = reconcile_cluster(&cluster, &platform, &exec).await.unwrap();
        assert_eq!(summary, PassSummary::default());

        assert_eq!(platform.applied_runners.lock().unwrap().len(), 2);
        assert_eq!(platform.applied_volumes.lock().unwrap().len(), 2);
        let access = platform.applied_access.lock().unwrap();
        assert_eq!(access.len(), 1);
        assert_eq!(
            access[0].service_account.metadata.name.as_deref(),
            Some("hippo-instance")
        );

        let statuses = platform.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].observed_generation, Some(3));
        assert_eq!(statuses[0].instance_sets[0].name, "daisy");
        assert!(exec.commands().is_empty());
    }

    #[tokio::test]
    async fn test_scale_down_skips_rollout() {
        let cluster = cluster(spec(&[("daisy", 1)]));
        let platform = FakePlatform {
            runners: vec![running("p"), runner("r", "daisy", "rev-2")],
            pods: vec![
                pod("p", "daisy", true, Some(naming::ROLE_PATRONI_LEADER)),
                pod("r", "daisy", true, Some(naming::ROLE_PATRONI_REPLICA)),
            ],
            ..FakePlatform::default()
        };
        let exec = FakeExec::default();

        let summary = reconcile_cluster(&cluster, &platform, &exec).await.unwrap();
        assert_eq!(platform.deleted_instances(), ["r"]);
        assert!(platform.deleted_pods.lock().unwrap().is_empty());
        assert!(summary.requeue);
        assert_eq!(summary.primary.as_deref(), Some("p"));
        assert_eq!(summary.ready, 2);
    }

    #[tokio::test]
    async fn test_rollout_after_scale() {
        let cluster = cluster(spec(&[("daisy", 2)]));
        let platform = FakePlatform {
            runners: vec![running("p"), runner("r", "daisy", "rev-2")],
            pods: vec![
                pod("p", "daisy", true, Some(naming::ROLE_PATRONI_LEADER)),
                pod("r", "daisy", true, Some(naming::ROLE_PATRONI_REPLICA)),
            ],
            ..FakePlatform::default()
        };
        let exec = FakeExec::default();

        let summary = reconcile_cluster(&cluster, &platform, &exec).await.unwrap();
        assert!(!summary.requeue);
        assert!(platform.deleted_instances().is_empty());
        assert_eq!(*platform.deleted_pods.lock().unwrap(), ["r-0"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_replicas_first() {
        let mut spec = spec(&[("daisy", 2)]);
        spec.shutdown = Some(true);
        let cluster = cluster(spec);
        let platform = FakePlatform {
            runners: vec![running("p"), running("r")],
            pods: vec![
                pod("p", "daisy", true, Some(naming::ROLE_PATRONI_LEADER)),
                pod("r", "daisy", true, Some(naming::ROLE_PATRONI_REPLICA)),
            ],
            ..FakePlatform::default()
        };
        let exec = FakeExec::default();

        let summary = reconcile_cluster(&cluster, &platform, &exec).await.unwrap();
        assert!(summary.requeue);
        assert_eq!(*platform.scaled.lock().unwrap(), [("r".to_string(), 0)]);
        assert!(platform.applied_runners.lock().unwrap().is_empty());
        assert!(platform.applied_access.lock().unwrap().is_empty());

        let statuses = platform.statuses.lock().unwrap();
        assert_eq!(statuses[0].startup_instance.as_deref(), Some("p"));
    }

    #[tokio::test]
    async fn test_switchover_guard_publishes_event() {
        let mut spec = spec(&[("daisy", 1)]);
        spec.patroni = Some(PatroniSpec {
            switchover: Some(PatroniSwitchover {
                enabled: true,
                ..PatroniSwitchover::default()
            }),
        });
        let mut cluster = cluster(spec);
        cluster.metadata.annotations = Some(BTreeMap::from([(
            naming::SWITCHOVER_ANNOTATION.to_string(),
            "t1".to_string(),
        )]));
        let platform = FakePlatform {
            runners: vec![running("p")],
            pods: vec![pod("p", "daisy", true, Some(naming::ROLE_PATRONI_LEADER))],
            ..FakePlatform::default()
        };
        let exec = FakeExec::default();

        let result = reconcile_cluster(&cluster, &platform, &exec).await;
        assert!(matches!(result, Err(Error::InsufficientInstances(1))));
        assert_eq!(platform.event_reasons(), ["SwitchoverInsufficientInstances"]);
        // Status is still written back.
        assert_eq!(platform.statuses.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_written() {
        let mut cluster = cluster(spec(&[]));
        cluster.metadata.generation = None;
        let platform = FakePlatform::default();

        reconcile_cluster(&cluster, &platform, &FakeExec::default())
            .await
            .unwrap();
        assert!(platform.statuses.lock().unwrap().is_empty());
    }
}
