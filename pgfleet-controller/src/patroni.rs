//! Commands sent to Patroni through `patronictl` inside a database container

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::instance::annotation;
use crate::naming;

/// A container to run commands in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRef {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerRef {
    /// The database container of `pod`.
    pub fn database(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            pod: pod.metadata.name.clone().unwrap_or_default(),
            container: naming::CONTAINER_DATABASE.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command in a container and collects its output. Implementations
/// return an error when the command cannot run or exits non-zero.
#[async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(&self, target: &ContainerRef, command: &[String]) -> Result<ExecOutput>;
}

/// Patroni member as printed by `patronictl list --format json`.
#[derive(Deserialize)]
struct ListedMember {
    #[serde(rename = "Role")]
    role: String,
    #[serde(rename = "TL")]
    timeline: Option<i64>,
}

/// Subset of the JSON Patroni writes to the "status" annotation of a Pod.
#[derive(Deserialize)]
struct MemberStatus {
    pending_restart: Option<serde_json::Value>,
}

/// Whether Patroni says `pod` must restart for configuration to take effect.
pub fn pod_requires_restart(pod: &Pod) -> bool {
    annotation(&pod.metadata, naming::ANNOTATION_PATRONI_STATUS)
        .and_then(|status| serde_json::from_str::<MemberStatus>(status).ok())
        .and_then(|status| status.pending_restart)
        .is_some_and(|pending| pending == serde_json::Value::Bool(true))
}

/// Calls `patronictl` in one container.
pub struct PatroniCtl<'a> {
    exec: &'a dyn PodExec,
    target: ContainerRef,
}

impl<'a> PatroniCtl<'a> {
    pub fn new(exec: &'a dyn PodExec, target: ContainerRef) -> Self {
        Self { exec, target }
    }

    async fn run(&self, action: &str, args: &[String]) -> Result<ExecOutput> {
        let mut command = vec!["patronictl".to_string()];
        command.extend_from_slice(args);

        let output = self.exec.exec(&self.target, &command).await?;
        debug!(
            pod = %self.target.pod,
            action,
            stdout = %output.stdout,
            stderr = %output.stderr,
            "patronictl finished"
        );
        Ok(output)
    }

    /// Restarts members with `role` in `scope` that have a pending restart.
    ///
    /// The command exits zero when it can read the DCS and reach the Patroni
    /// API. A "restart conditions are not satisfied" reply for a member means
    /// it already restarted.
    pub async fn restart_pending_members(&self, role: &str, scope: &str) -> Result<()> {
        let args = [
            "restart".to_string(),
            "--pending".to_string(),
            "--force".to_string(),
            format!("--role={}", role),
            scope.to_string(),
        ];
        self.run("restart-pending", &args).await.map(|_| ())
    }

    /// Timeline of the current leader, or zero when there is no leader.
    pub async fn get_timeline(&self) -> Result<i64> {
        let args = ["list".to_string(), "--format".to_string(), "json".to_string()];
        let output = self.run("get-timeline", &args).await?;

        let members: Vec<ListedMember> = serde_json::from_str(&output.stdout)
            .map_err(|e| Error::Timeline(format!("unexpected patronictl output: {}", e)))?;

        Ok(members
            .into_iter()
            .find(|m| m.role == "Leader" || m.role == "Standby Leader")
            .and_then(|m| m.timeline)
            .unwrap_or(0))
    }

    /// Asks Patroni to move leadership to `target`, or to a candidate of its
    /// choosing when `target` is empty. Returns true when an election
    /// completed.
    pub async fn switchover_and_wait(&self, target: &str) -> Result<bool> {
        let args = [
            "switchover".to_string(),
            "--scheduled=now".to_string(),
            "--force".to_string(),
            format!("--candidate={}", target),
        ];
        let output = self.run("switchover", &args).await?;

        // The command exits zero even when the API refused. Patroni prints
        // "Switched over" (capitalized) when it picked another candidate.
        Ok(output.stdout.contains("switched over"))
    }

    /// Forces leadership to `target`, even without a healthy leader.
    pub async fn failover_and_wait(&self, target: &str) -> Result<bool> {
        let args = [
            "failover".to_string(),
            "--force".to_string(),
            format!("--candidate={}", target),
        ];
        let output = self.run("failover", &args).await?;
        Ok(output.stdout.contains("failed over"))
    }

    /// Demotes `current` in favor of `next`, or of Patroni's choice when
    /// `next` is empty.
    pub async fn change_primary_and_wait(&self, current: &str, next: &str) -> Result<bool> {
        let args = [
            "switchover".to_string(),
            "--scheduled=now".to_string(),
            "--force".to_string(),
            format!("--master={}", current),
            format!("--candidate={}", next),
        ];
        let output = self.run("change-primary", &args).await?;
        Ok(output.stdout.contains("switched over"))
    }
}
