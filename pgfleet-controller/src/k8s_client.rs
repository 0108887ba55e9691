//! Kubernetes implementation of the platform and exec capabilities

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, Preconditions,
};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use pgfleet_models::{PostgresCluster, PostgresClusterStatus};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::naming;
use crate::patroni::{ContainerRef, ExecOutput, PodExec};
use crate::platform::Platform;
use crate::scale::PatroniAccess;

/// Get a Kubernetes client
pub async fn get_k8s_client() -> Result<Client> {
    Ok(Client::try_default().await?)
}

/// Ignores "not found" from a delete or patch.
fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether `meta` names the object with `uid` as its controller.
fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Merge patch of the status subresource. With a resourceVersion, the API
/// server rejects it with a conflict when the cluster changed since it was
/// read.
fn status_patch(
    status: &PostgresClusterStatus,
    resource_version: Option<&str>,
) -> serde_json::Value {
    match resource_version {
        Some(version) => json!({
            "metadata": { "resourceVersion": version },
            "status": status,
        }),
        None => json!({ "status": status }),
    }
}

/// Runs commands in containers through the Kubernetes exec API.
#[derive(Clone)]
pub struct KubeExec {
    client: Client,
    timeout: Duration,
}

impl KubeExec {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn run(&self, target: &ContainerRef, command: &[String]) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let params = AttachParams::default()
            .container(target.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = pods.exec(&target.pod, command.to_vec(), &params).await?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let read_stdout = async {
            if let Some(mut reader) = stdout_reader {
                reader.read_to_string(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_stderr = async {
            if let Some(mut reader) = stderr_reader {
                reader.read_to_string(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out, err) = tokio::join!(read_stdout, read_stderr);
        for result in [out, err] {
            result.map_err(|e| Error::Exec {
                pod: target.pod.clone(),
                message: e.to_string(),
            })?;
        }

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        match status {
            Some(status) if status.status.as_deref() != Some("Success") => Err(Error::Exec {
                pod: target.pod.clone(),
                message: status
                    .message
                    .unwrap_or_else(|| format!("{}{}", stderr, stdout)),
            }),
            _ => Ok(ExecOutput { stdout, stderr }),
        }
    }
}

#[async_trait]
impl PodExec for KubeExec {
    async fn exec(&self, target: &ContainerRef, command: &[String]) -> Result<ExecOutput> {
        debug!(pod = %target.pod, container = %target.container, ?command, "exec");
        tokio::time::timeout(self.timeout, self.run(target, command))
            .await
            .map_err(|_| Error::ExecTimeout {
                pod: target.pod.clone(),
                timeout: self.timeout,
            })?
    }
}

/// The platform for one PostgresCluster.
pub struct KubePlatform {
    client: Client,
    namespace: String,
    cluster: String,
    uid: Option<String>,
    resource_version: Option<String>,
    recorder: Recorder,
}

impl KubePlatform {
    pub fn new(client: Client, cluster: &PostgresCluster) -> Self {
        let reporter = Reporter {
            controller: naming::FIELD_MANAGER.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter, cluster.object_ref(&()));

        Self {
            namespace: cluster.namespace().unwrap_or_default(),
            cluster: cluster.name_any(),
            uid: cluster.uid(),
            resource_version: cluster.resource_version(),
            client,
            recorder,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn list<K>(&self, selector: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let list = self
            .api::<K>()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items)
    }

    async fn apply<K>(&self, object: &K) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + serde::Serialize
            + std::fmt::Debug,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        let params = PatchParams::apply(naming::FIELD_MANAGER).force();
        self.api::<K>()
            .patch(&name, &params, &Patch::Apply(object))
            .await?;
        Ok(())
    }

    /// Deletes the objects matching `selector` that the cluster controls.
    async fn delete_controlled<K>(&self, uid: &str, selector: &str) -> Result<()>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
    {
        for object in self.list::<K>(selector).await? {
            let name = object.name_any();
            if !is_controlled_by(object.meta(), uid) {
                debug!(cluster = %self.cluster, %name, "not controlled by cluster, keeping");
                continue;
            }
            let params = DeleteParams {
                preconditions: Some(Preconditions {
                    uid: object.meta().uid.clone(),
                    resource_version: None,
                }),
                ..DeleteParams::background()
            };
            ignore_not_found(self.api::<K>().delete(&name, &params).await)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn list_runners(&self, selector: &str) -> Result<Vec<StatefulSet>> {
        self.list(selector).await
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        self.list(selector).await
    }

    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        self.list(selector).await
    }

    async fn apply_runner(&self, runner: &StatefulSet) -> Result<()> {
        self.apply(runner).await
    }

    async fn apply_volume(&self, volume: &PersistentVolumeClaim) -> Result<()> {
        self.apply(volume).await
    }

    async fn apply_access(&self, access: &PatroniAccess) -> Result<()> {
        self.apply(&access.service_account).await?;
        self.apply(&access.role).await?;
        self.apply(&access.role_binding).await
    }

    async fn scale_runner(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        ignore_not_found(
            self.api::<StatefulSet>()
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await,
        )
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
            }),
            ..DeleteParams::default()
        };
        // A conflict means the Pod changed since it was observed; the next
        // pass decides again.
        self.api::<Pod>()
            .delete(&pod.name_any(), &params)
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, instance: &str) -> Result<()> {
        let uid = self.uid.as_deref().ok_or_else(|| {
            Error::InvariantViolation(format!("cluster {} has no uid", self.cluster))
        })?;
        let selector = naming::cluster_instance(&self.cluster, instance);
        self.delete_controlled::<ConfigMap>(uid, &selector).await?;
        self.delete_controlled::<Secret>(uid, &selector).await?;
        self.delete_controlled::<StatefulSet>(uid, &selector).await?;
        self.delete_controlled::<PersistentVolumeClaim>(uid, &selector).await
    }

    async fn publish_warning(&self, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(event).await {
            warn!(cluster = %self.cluster, reason, error = %e, "failed to publish event");
        }
    }

    async fn write_status(&self, status: &PostgresClusterStatus) -> Result<()> {
        let patch = status_patch(status, self.resource_version.as_deref());
        self.api::<PostgresCluster>()
            .patch_status(&self.cluster, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
