//! Controller configuration from environment variables.

use crate::error::ControllerError;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once at start-up.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub leader_election: Option<LeaderElectionConfig>,
    /// Worker tasks per typed reconciler
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempts before a non-transient error drops the request
    pub max_permanent_retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaderElectionConfig {
    pub namespace: String,
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            leader_election: None,
            workers: 2,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            max_permanent_retries: 5,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let leader_election = if parse_or(&lookup, "ENABLE_LEADER_ELECTION", false)? {
            let config = LeaderElectionConfig {
                namespace: lookup("LEADER_ELECTION_NAMESPACE")
                    .unwrap_or_else(|| crds::NAMESPACE_SYSTEM.to_string()),
                lease_name: lookup("LEADER_ELECTION_ID").unwrap_or_else(|| crds::GROUP.to_string()),
                identity: lookup("POD_NAME")
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                lease_duration: Duration::from_secs(parse_or(&lookup, "LEASE_DURATION_SECS", 30)?),
                renew_interval: Duration::from_secs(parse_or(&lookup, "RENEW_INTERVAL_SECS", 20)?),
                retry_interval: Duration::from_secs(parse_or(&lookup, "RETRY_INTERVAL_SECS", 5)?),
            };
            if config.renew_interval >= config.lease_duration {
                return Err(ControllerError::InvalidConfig(format!(
                    "RENEW_INTERVAL_SECS ({}s) must be shorter than LEASE_DURATION_SECS ({}s)",
                    config.renew_interval.as_secs(),
                    config.lease_duration.as_secs()
                )));
            }
            Some(config)
        } else {
            None
        };

        let workers = parse_or(&lookup, "CONTROLLER_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "CONTROLLER_WORKERS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            leader_election,
            workers,
            backoff_base: Duration::from_millis(parse_or(&lookup, "BACKOFF_BASE_MS", 5)?),
            backoff_max: Duration::from_secs(parse_or(&lookup, "BACKOFF_MAX_SECS", 1000)?),
            max_permanent_retries: parse_or(
                &lookup,
                "MAX_PERMANENT_RETRIES",
                defaults.max_permanent_retries,
            )?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{}={:?}: {}", key, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert!(config.leader_election.is_none());
    }

    #[test]
    fn test_leader_election_settings() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("ENABLE_LEADER_ELECTION", "true"),
            ("POD_NAME", "tenant-controller-0"),
            ("LEASE_DURATION_SECS", "15"),
            ("RENEW_INTERVAL_SECS", "10"),
        ]))
        .unwrap();
        let le = config.leader_election.unwrap();
        assert_eq!(le.identity, "tenant-controller-0");
        assert_eq!(le.namespace, "kuber");
        assert_eq!(le.lease_name, "go.kuber.io");
        assert_eq!(le.lease_duration, Duration::from_secs(15));
    }

    #[test]
    fn test_renew_must_be_shorter_than_lease() {
        let err = ControllerConfig::from_lookup(lookup(&[
            ("ENABLE_LEADER_ELECTION", "true"),
            ("LEASE_DURATION_SECS", "10"),
            ("RENEW_INTERVAL_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ControllerConfig::from_lookup(lookup(&[("CONTROLLER_WORKERS", "many")])).is_err());
        assert!(ControllerConfig::from_lookup(lookup(&[("CONTROLLER_WORKERS", "0")])).is_err());
    }
}
