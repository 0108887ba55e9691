//! Redeploying instances whose Pod no longer matches its template
//!
//! At most one available instance is taken down at a time. Instances that
//! are already unavailable are redeployed without waiting.

use std::time::Duration;

use async_trait::async_trait;
use pgfleet_models::PostgresClusterSpec;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::instance::{by_priority, Instance, ObservedInstances};
use crate::patroni::{ContainerRef, PatroniCtl, PodExec};
use crate::platform::Platform;

/// Most available instances taken down at once by a rollout.
const MAX_UNAVAILABLE: i32 = 1;

/// Grace period Kubernetes applies when a Pod does not set one.
const DEFAULT_TERMINATION_GRACE_SECONDS: i64 = 30;

/// Replaces the Pod of one instance.
#[async_trait]
pub trait Redeploy: Send + Sync {
    async fn redeploy(&self, instance: &Instance) -> Result<()>;
}

/// Redeploys outdated instances, least valuable first, keeping at least
/// `specified replicas - 1` instances available. Returns the names of the
/// instances redeployed.
///
/// The first failed redeploy stops the rollout. Instances already
/// redeployed stay that way.
pub async fn rollout_instances(
    spec: &PostgresClusterSpec,
    observed: &ObservedInstances,
    redeploy: &dyn Redeploy,
) -> Result<Vec<String>> {
    let specified = spec.specified_replicas();
    let mut available = 0;
    let mut consider: Vec<&Instance> = Vec::new();

    for instance in observed.for_cluster() {
        // Orphans are neither redeployed nor counted.
        if instance.spec.is_none() {
            continue;
        }
        if instance.is_terminating() != Some(false) {
            continue;
        }
        if instance.is_available() == Some(true) {
            available += 1;
        }
        if instance.pod_matches_pod_template() == Some(false) {
            consider.push(instance);
        }
    }

    consider.sort_by(|a, b| by_priority(a, b));
    let mut unavailable = specified - available;
    debug!(
        instances = observed.len(),
        specified,
        available,
        considering = consider.len(),
        "rollout"
    );

    let mut redeployed = Vec::new();
    for instance in consider {
        if instance.is_available() == Some(false) {
            redeploy.redeploy(instance).await?;
        } else if unavailable < MAX_UNAVAILABLE {
            redeploy.redeploy(instance).await?;
            unavailable += 1;
        } else {
            continue;
        }
        redeployed.push(instance.name.clone());
    }
    Ok(redeployed)
}

/// Redeploys an instance by deleting its Pod so its runner recreates it.
///
/// A primary with other instances around hands off leadership first and
/// is deleted on a later pass, once it is a replica. A lone primary gets
/// an immediate checkpoint so that its shutdown finishes before the grace
/// period runs out.
pub struct PodRedeployer<'a> {
    pub platform: &'a dyn Platform,
    pub exec: &'a dyn PodExec,
    pub observed: &'a ObservedInstances,
}

impl PodRedeployer<'_> {
    async fn checkpoint(&self, target: &ContainerRef, grace_seconds: i64) -> Result<Duration> {
        let command: Vec<String> = [
            "psql",
            "--quiet",
            "--no-psqlrc",
            "--set=ON_ERROR_STOP=1",
            "--command",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([format!(
            "SET statement_timeout = '{}s'; CHECKPOINT;",
            grace_seconds
        )])
        .collect();

        let start = Instant::now();
        let result = self.exec.exec(target, &command).await;
        let elapsed = start.elapsed();

        debug!(pod = %target.pod, ?elapsed, ok = result.is_ok(), "attempted checkpoint");
        result.map(|_| elapsed)
    }
}

#[async_trait]
impl Redeploy for PodRedeployer<'_> {
    async fn redeploy(&self, instance: &Instance) -> Result<()> {
        let pod = match (&instance.runner, instance.pods.as_slice()) {
            (Some(_), [pod]) => pod,
            _ => {
                return Err(Error::InvariantViolation(format!(
                    "{} has {} pods during rollout",
                    instance.name,
                    instance.pods.len()
                )))
            }
        };
        let target = ContainerRef::database(pod);
        let primary = instance.is_primary() == Some(true);

        if primary && self.observed.len() > 1 {
            info!(instance = %instance.name, "changing primary before redeploy");
            let changed = PatroniCtl::new(self.exec, target.clone())
                .change_primary_and_wait(&target.pod, "")
                .await?;
            if !changed {
                return Err(Error::LeaderNotChanged("switchover"));
            }
            return Ok(());
        }

        if primary {
            let grace_seconds = pod
                .spec
                .as_ref()
                .and_then(|s| s.termination_grace_period_seconds)
                .unwrap_or(DEFAULT_TERMINATION_GRACE_SECONDS);
            let threshold = Duration::from_secs((grace_seconds / 2).max(0) as u64);

            // The first checkpoint may flush a lot. A second one tells how
            // long a fast shutdown would take.
            let mut result = self.checkpoint(&target, grace_seconds).await;
            if matches!(result, Ok(elapsed) if elapsed > threshold) {
                result = self.checkpoint(&target, grace_seconds).await;
            }

            match result {
                Err(e) => {
                    self.platform
                        .publish_warning(
                            "NoCheckpoint",
                            format!("Unable to checkpoint primary before shutdown: {}", e),
                        )
                        .await
                }
                Ok(elapsed) if elapsed > threshold => {
                    self.platform
                        .publish_warning(
                            "SlowCheckpoint",
                            format!(
                                "Shutting down primary despite checkpoint taking over {:?}",
                                elapsed
                            ),
                        )
                        .await
                }
                Ok(_) => {}
            }
        }

        info!(instance = %instance.name, pod = %target.pod, "redeploying instance");
        self.platform.delete_pod(pod).await
    }
}
