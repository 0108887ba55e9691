//! Reconciliation engine for PostgreSQL clusters managed with Patroni
//!
//! A pass observes the instances of one `PostgresCluster`, scales its
//! instance sets, rolls out Pod template changes one instance at a time and
//! coordinates leadership with Patroni.

pub mod cluster;
pub mod error;
pub mod instance;
pub mod k8s_client;
pub mod leadership;
pub mod naming;
pub mod patroni;
pub mod platform;
pub mod rollout;
pub mod scale;

pub use cluster::{reconcile_cluster, PassSummary};
pub use error::{Error, Result};
pub use instance::{by_priority, Instance, ObservedInstances};
pub use k8s_client::{get_k8s_client, KubeExec, KubePlatform};
pub use patroni::{ContainerRef, ExecOutput, PodExec};
pub use platform::Platform;
