//! Label keys, role values and object names shared by every reconciler
//!
//! All objects belonging to a cluster carry `LABEL_CLUSTER`. Objects of one
//! instance additionally carry `LABEL_INSTANCE_SET` and `LABEL_INSTANCE`.

use uuid::Uuid;

pub use pgfleet_models::SWITCHOVER_ANNOTATION;

/// Cluster that owns an object
pub const LABEL_CLUSTER: &str = "pgfleet.io/cluster";

/// Instance set of an instance's objects
pub const LABEL_INSTANCE_SET: &str = "pgfleet.io/instance-set";

/// Instance of an instance's objects
pub const LABEL_INSTANCE: &str = "pgfleet.io/instance";

/// Role of a Pod in the Patroni cluster, or the purpose of a volume
pub const LABEL_ROLE: &str = "pgfleet.io/role";

/// Patroni scope of a Pod. Patroni finds the members of a scope by this
/// label.
pub const LABEL_PATRONI: &str = "pgfleet.io/patroni";

/// Set by Patroni on the Pod of the elected leader.
///
/// This is the only value used to identify the primary by label.
pub const ROLE_PATRONI_LEADER: &str = "master";

/// Set by Patroni on the Pods of replicas
pub const ROLE_PATRONI_REPLICA: &str = "replica";

/// Role of the PersistentVolumeClaim holding PGDATA
pub const ROLE_POSTGRES_DATA: &str = "pgdata";

/// Label the StatefulSet controller puts on every Pod it creates
pub const LABEL_POD_TEMPLATE_REVISION: &str = "controller-revision-hash";

/// Pod annotation where Patroni publishes its member status as JSON
pub const ANNOTATION_PATRONI_STATUS: &str = "status";

/// Container running PostgreSQL and Patroni
pub const CONTAINER_DATABASE: &str = "database";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "pgfleet-operator";

/// Scope of the Patroni cluster, shared by all members.
pub fn patroni_scope(cluster_name: &str) -> String {
    format!("{}-ha", cluster_name)
}

/// ServiceAccount that instance Pods run as, allowed to use the Kubernetes
/// API as Patroni's configuration store.
pub fn instance_service_account(cluster_name: &str) -> String {
    format!("{}-instance", cluster_name)
}

/// Random name for a new member of `set` in `cluster`.
pub fn generate_instance(cluster_name: &str, set_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", cluster_name, set_name, &suffix[..4])
}

/// Name of the PersistentVolumeClaim holding PGDATA for `instance_name`.
pub fn instance_data_volume(instance_name: &str) -> String {
    format!("{}-pgdata", instance_name)
}

/// Selects every instance object of a cluster.
pub fn cluster_instances(cluster_name: &str) -> String {
    format!("{}={},{}", LABEL_CLUSTER, cluster_name, LABEL_INSTANCE_SET)
}

/// Selects the objects of one instance.
pub fn cluster_instance(cluster_name: &str, instance_name: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_CLUSTER, cluster_name, LABEL_INSTANCE, instance_name
    )
}

/// Selects the PGDATA volumes of a cluster.
pub fn cluster_data_volumes(cluster_name: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_CLUSTER, cluster_name, LABEL_ROLE, ROLE_POSTGRES_DATA
    )
}
