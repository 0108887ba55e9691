//! Errors returned by reconciliation steps

use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any failed call to the Kubernetes API, including conflicts
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A command in a container could not run or exited non-zero
    #[error("exec in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },

    #[error("exec in pod {pod} did not finish within {timeout:?}")]
    ExecTimeout { pod: String, timeout: Duration },

    /// Observed state contradicts what an algorithm verified; acting could
    /// touch the wrong object
    #[error("unexpected instance state: {0}")]
    InvariantViolation(String),

    /// A switchover or failover was requested on a cluster with one instance.
    /// Instances still being created can satisfy it on a later pass.
    #[error("need more than one instance to switchover, found {0}")]
    InsufficientInstances(usize),

    #[error("invalid switchover request: {0}")]
    InvalidSwitchover(String),

    /// Patroni answered, but did not change the primary
    #[error("unable to {0}")]
    LeaderNotChanged(&'static str),

    /// No instance has a running database container to host a command
    #[error("no running instance to {0}")]
    NoRunningInstance(&'static str),

    #[error("unable to read Patroni timeline: {0}")]
    Timeline(String),

    #[error("unable to render {name}: {source}")]
    Template {
        name: &'static str,
        #[source]
        source: tera::Error,
    },

    #[error("invalid YAML for {name}: {source}")]
    Yaml {
        name: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether another pass, after backoff, might succeed without any
    /// change to the cluster spec.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_)
            | Error::Exec { .. }
            | Error::ExecTimeout { .. }
            | Error::LeaderNotChanged(_)
            | Error::NoRunningInstance(_)
            | Error::InsufficientInstances(_)
            | Error::Timeline(_) => true,
            Error::InvariantViolation(_)
            | Error::InvalidSwitchover(_)
            | Error::Template { .. }
            | Error::Yaml { .. }
            | Error::Serialization(_) => false,
        }
    }

    /// Short CamelCase reason used for Kubernetes events.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "KubernetesError",
            Error::Exec { .. } | Error::ExecTimeout { .. } => "ExecFailed",
            Error::InvariantViolation(_) => "UnexpectedState",
            Error::InsufficientInstances(_) => "SwitchoverInsufficientInstances",
            Error::InvalidSwitchover(_) => "SwitchoverInvalid",
            Error::LeaderNotChanged(_) => "SwitchoverFailed",
            Error::NoRunningInstance(_) => "NoRunningInstance",
            Error::Timeline(_) => "TimelineUnavailable",
            Error::Template { .. } | Error::Yaml { .. } | Error::Serialization(_) => {
                "GenerationFailed"
            }
        }
    }
}
