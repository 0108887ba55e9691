//! Everything a reconciliation pass reads from or writes to the cluster
//!
//! A [`Platform`] is bound to one `PostgresCluster`: selectors and names
//! passed to it are already scoped to that cluster's namespace.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use pgfleet_models::PostgresClusterStatus;

use crate::error::Result;
use crate::scale::PatroniAccess;

#[async_trait]
pub trait Platform: Send + Sync {
    async fn list_runners(&self, selector: &str) -> Result<Vec<StatefulSet>>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    async fn list_volumes(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    /// Create or update with server-side apply.
    async fn apply_runner(&self, runner: &StatefulSet) -> Result<()>;

    /// Create or update with server-side apply.
    async fn apply_volume(&self, volume: &PersistentVolumeClaim) -> Result<()>;

    /// Create or update the identity of instance Pods with server-side apply.
    async fn apply_access(&self, access: &PatroniAccess) -> Result<()>;

    /// Sets the replicas of a runner. A missing runner is not an error.
    async fn scale_runner(&self, name: &str, replicas: i32) -> Result<()>;

    /// Deletes `pod` only if it is still the exact object that was observed.
    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    /// Deletes every object of an instance: ConfigMaps, Secrets, the runner
    /// and its volumes.
    async fn delete_instance(&self, instance: &str) -> Result<()>;

    /// Records a warning event on the cluster. Failures are logged, never
    /// returned.
    async fn publish_warning(&self, reason: &str, note: String);

    async fn write_status(&self, status: &PostgresClusterStatus) -> Result<()>;
}
