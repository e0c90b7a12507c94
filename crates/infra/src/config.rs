//! Configuration loading and representation.

use std::time::Duration;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Process settings for the batch-changes workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub db_max_connections: u32,
    pub worker_num_handlers: usize,
    pub worker_poll_interval: Duration,
    pub worker_heartbeat_interval: Duration,
    pub resetter_interval: Duration,
}

impl Settings {
    pub const DATABASE_URL: &'static str = "DATABASE_URL";
    pub const DB_MAX_CONNECTIONS: &'static str = "BATCHES_DB_MAX_CONNECTIONS";
    pub const WORKER_NUM_HANDLERS: &'static str = "BATCHES_WORKER_NUM_HANDLERS";
    pub const WORKER_POLL_INTERVAL_MS: &'static str = "BATCHES_WORKER_POLL_INTERVAL_MS";
    pub const WORKER_HEARTBEAT_INTERVAL_MS: &'static str = "BATCHES_WORKER_HEARTBEAT_INTERVAL_MS";
    pub const RESETTER_INTERVAL_MS: &'static str = "BATCHES_RESETTER_INTERVAL_MS";

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup(Self::DATABASE_URL)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(Self::DATABASE_URL))?;

        Ok(Self {
            database_url,
            db_max_connections: parse_or(&lookup, Self::DB_MAX_CONNECTIONS, 10)?,
            worker_num_handlers: parse_or(&lookup, Self::WORKER_NUM_HANDLERS, 1)?,
            worker_poll_interval: millis_or(&lookup, Self::WORKER_POLL_INTERVAL_MS, 1_000)?,
            worker_heartbeat_interval: millis_or(
                &lookup,
                Self::WORKER_HEARTBEAT_INTERVAL_MS,
                1_000,
            )?,
            resetter_interval: millis_or(&lookup, Self::RESETTER_INTERVAL_MS, 60_000)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialOrd + Default,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) if v > T::default() => Ok(v),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply() {
        let s =
            Settings::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/db")])).unwrap();
        assert_eq!(s.worker_num_handlers, 1);
        assert_eq!(s.db_max_connections, 10);
        assert_eq!(s.worker_poll_interval, Duration::from_secs(1));
        assert_eq!(s.resetter_interval, Duration::from_secs(60));
    }

    #[test]
    fn overrides_are_parsed() {
        let s = Settings::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/db"),
            ("BATCHES_WORKER_NUM_HANDLERS", "8"),
            ("BATCHES_WORKER_HEARTBEAT_INTERVAL_MS", " 250 "),
        ]))
        .unwrap();
        assert_eq!(s.worker_num_handlers, 8);
        assert_eq!(s.worker_heartbeat_interval, Duration::from_millis(250));
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            Settings::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn malformed_and_zero_values_are_rejected() {
        for bad in ["abc", "0", "-1"] {
            let err = Settings::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://localhost/db"),
                ("BATCHES_WORKER_NUM_HANDLERS", bad),
            ]))
            .unwrap_err();
            assert_eq!(
                err,
                ConfigError::Invalid { key: "BATCHES_WORKER_NUM_HANDLERS", value: bad.to_string() }
            );
        }
    }
}
