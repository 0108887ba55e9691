//! Runs reconciliation passes for every PostgresCluster

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Action, Controller, Error as ControllerError};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use pgfleet_controller::{naming, reconcile_cluster, Error, KubeExec, KubePlatform, PassSummary};
use pgfleet_models::{ClusterSummary, PostgresCluster};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Latest summary of every reconciled cluster, keyed by namespace and name.
pub type SharedState = Arc<RwLock<BTreeMap<(String, String), ClusterSummary>>>;

struct Context {
    client: Client,
    exec: KubeExec,
    config: Config,
    state: SharedState,
}

async fn reconcile(cluster: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let platform = KubePlatform::new(ctx.client.clone(), &cluster);
    debug!(cluster = %cluster.name_any(), namespace = ?cluster.namespace(), "reconciling");

    let result = reconcile_cluster(&cluster, &platform, &ctx.exec).await;
    record(&ctx.state, &cluster, &result).await;

    let summary = result?;
    Ok(if summary.requeue {
        Action::requeue(ctx.config.error_requeue_after)
    } else {
        Action::requeue(ctx.config.requeue_after)
    })
}

fn error_policy(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconcile failed: {}",
        error
    );
    if error.is_retryable() {
        Action::requeue(ctx.config.error_requeue_after)
    } else {
        Action::requeue(ctx.config.requeue_after)
    }
}

async fn record(
    state: &SharedState,
    cluster: &PostgresCluster,
    result: &Result<PassSummary, Error>,
) {
    let key = (cluster.namespace().unwrap_or_default(), cluster.name_any());
    let mut clusters = state.write().await;
    let previous = clusters.get(&key).cloned();

    let summary = match result {
        Ok(pass) => ClusterSummary {
            namespace: key.0.clone(),
            name: key.1.clone(),
            instances: pass.instances,
            ready: pass.ready,
            primary: pass.primary.clone(),
            reconciled_at: Utc::now(),
            last_error: None,
        },
        Err(e) => ClusterSummary {
            namespace: key.0.clone(),
            name: key.1.clone(),
            instances: previous.as_ref().map_or(0, |s| s.instances),
            ready: previous.as_ref().map_or(0, |s| s.ready),
            primary: previous.and_then(|s| s.primary),
            reconciled_at: Utc::now(),
            last_error: Some(e.to_string()),
        },
    };
    clusters.insert(key, summary);
}

/// The cluster that an instance Pod belongs to.
fn cluster_of(pod: &Pod) -> Option<ObjectRef<PostgresCluster>> {
    let name = pod.labels().get(naming::LABEL_CLUSTER)?;
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Watches clusters, their runners and their Pods until a shutdown signal.
pub async fn run(client: Client, config: Config, state: SharedState) -> Result<()> {
    let (clusters, runners, pods) = match &config.namespace {
        Some(ns) => (
            Api::<PostgresCluster>::namespaced(client.clone(), ns),
            Api::<StatefulSet>::namespaced(client.clone(), ns),
            Api::<Pod>::namespaced(client.clone(), ns),
        ),
        None => (
            Api::<PostgresCluster>::all(client.clone()),
            Api::<StatefulSet>::all(client.clone()),
            Api::<Pod>::all(client.clone()),
        ),
    };

    clusters
        .list(&ListParams::default().limit(1))
        .await
        .context("PostgresCluster CRD is not installed; run `pgfleet-operator crd`")?;

    info!(namespace = ?config.namespace, "starting controller");
    let instances = watcher::Config::default().labels(naming::LABEL_CLUSTER);
    let ctx = Arc::new(Context {
        exec: KubeExec::new(client.clone(), config.exec_timeout),
        client,
        config,
        state: state.clone(),
    });

    Controller::new(clusters, watcher::Config::default())
        .owns(runners, instances.clone())
        .watches(pods, instances, |pod| cluster_of(&pod))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            let state = state.clone();
            async move {
                match result {
                    Ok((cluster, _)) => debug!(cluster = %cluster.name, "reconciled"),
                    Err(ControllerError::ObjectNotFound(cluster)) => {
                        info!(cluster = %cluster.name, "cluster is gone");
                        let key = (cluster.namespace.unwrap_or_default(), cluster.name);
                        state.write().await.remove(&key);
                    }
                    Err(e) => debug!(error = %e, "controller"),
                }
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}
