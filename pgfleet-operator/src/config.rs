use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch, or every namespace when unset
    pub namespace: Option<String>,
    pub health_port: u16,
    /// Longest a command in a database container may run
    pub exec_timeout: Duration,
    /// Delay before a successful pass runs again
    pub requeue_after: Duration,
    /// Delay before a failed or unfinished pass runs again
    pub error_requeue_after: Duration,
}

impl Config {
    /// Reads the process environment. `.env` is loaded by `main`.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            namespace: lookup("PGFLEET_NAMESPACE").filter(|ns| !ns.is_empty()),
            health_port: parse_or(&lookup, "PGFLEET_HEALTH_PORT", 8080)?,
            exec_timeout: Duration::from_secs(parse_or(&lookup, "PGFLEET_EXEC_TIMEOUT_SECS", 60)?),
            requeue_after: Duration::from_secs(parse_or(&lookup, "PGFLEET_REQUEUE_SECS", 300)?),
            error_requeue_after: Duration::from_secs(parse_or(
                &lookup,
                "PGFLEET_ERROR_REQUEUE_SECS",
                30,
            )?),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, value)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.namespace, None);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.exec_timeout, Duration::from_secs(60));
        assert_eq!(config.requeue_after, Duration::from_secs(300));
        assert_eq!(config.error_requeue_after, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_and_errors() {
        let env = HashMap::from([
            ("PGFLEET_NAMESPACE", "db"),
            ("PGFLEET_HEALTH_PORT", "9000"),
            ("PGFLEET_EXEC_TIMEOUT_SECS", "5"),
        ]);
        let config = Config::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.namespace.as_deref(), Some("db"));
        assert_eq!(config.health_port, 9000);
        assert_eq!(config.exec_timeout, Duration::from_secs(5));

        let err = Config::from_lookup(|k| (k == "PGFLEET_HEALTH_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PGFLEET_HEALTH_PORT"));
    }
}
