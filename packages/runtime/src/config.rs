//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shigoto_core::PausePolicy;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for a `Shigoto` instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShigotoConfig {
    /// Queue used when a task does not name one.
    pub default_queue: String,
    /// Ceiling for the worker count of any single queue.
    pub max_workers: usize,
    /// How long closing a pool waits for running jobs (seconds).
    pub drain_timeout_secs: u64,
    /// Pause after a failed TaskBoard read before retrying (milliseconds).
    pub read_error_backoff_ms: u64,
    /// Whether pausing abandons a TaskBoard read that is already waiting.
    pub pause_policy: PausePolicy,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for ShigotoConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            max_workers: 100,
            drain_timeout_secs: 120,
            read_error_backoff_ms: 1000,
            pause_policy: PausePolicy::Immediate,
            event_capacity: 1024,
        }
    }
}

impl ShigotoConfig {
    /// Build a config from environment variables.
    ///
    /// - `SHIGOTO_DEFAULT_QUEUE` (default: `default`)
    /// - `SHIGOTO_MAX_WORKERS` (default: 100)
    /// - `SHIGOTO_DRAIN_TIMEOUT_SECS` (default: 120)
    /// - `SHIGOTO_READ_ERROR_BACKOFF_MS` (default: 1000)
    /// - `SHIGOTO_PAUSE_POLICY` (`immediate` or `after_read`, default: `immediate`)
    /// - `SHIGOTO_EVENT_CAPACITY` (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(queue) = var("SHIGOTO_DEFAULT_QUEUE") {
            cfg.default_queue = queue;
        }
        if let Some(v) = var("SHIGOTO_MAX_WORKERS") {
            cfg.max_workers = parse("SHIGOTO_MAX_WORKERS", v)?;
        }
        if let Some(v) = var("SHIGOTO_DRAIN_TIMEOUT_SECS") {
            cfg.drain_timeout_secs = parse("SHIGOTO_DRAIN_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = var("SHIGOTO_READ_ERROR_BACKOFF_MS") {
            cfg.read_error_backoff_ms = parse("SHIGOTO_READ_ERROR_BACKOFF_MS", v)?;
        }
        if let Some(v) = var("SHIGOTO_PAUSE_POLICY") {
            cfg.pause_policy = parse("SHIGOTO_PAUSE_POLICY", v)?;
        }
        if let Some(v) = var("SHIGOTO_EVENT_CAPACITY") {
            let capacity: usize = parse("SHIGOTO_EVENT_CAPACITY", v.clone())?;
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    key: "SHIGOTO_EVENT_CAPACITY",
                    value: v,
                    reason: "must be at least 1".to_string(),
                });
            }
            cfg.event_capacity = capacity;
        }

        Ok(cfg)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn read_error_backoff(&self) -> Duration {
        Duration::from_millis(self.read_error_backoff_ms)
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = ShigotoConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, ShigotoConfig::default());
        assert_eq!(cfg.drain_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn reads_every_key() {
        let cfg = ShigotoConfig::from_lookup(lookup(&[
            ("SHIGOTO_DEFAULT_QUEUE", "mail"),
            ("SHIGOTO_MAX_WORKERS", "12"),
            ("SHIGOTO_DRAIN_TIMEOUT_SECS", "5"),
            ("SHIGOTO_READ_ERROR_BACKOFF_MS", "50"),
            ("SHIGOTO_PAUSE_POLICY", "after_read"),
            ("SHIGOTO_EVENT_CAPACITY", "16"),
        ]))
        .unwrap();

        assert_eq!(cfg.default_queue, "mail");
        assert_eq!(cfg.max_workers, 12);
        assert_eq!(cfg.drain_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.read_error_backoff(), Duration::from_millis(50));
        assert_eq!(cfg.pause_policy, PausePolicy::AfterRead);
        assert_eq!(cfg.event_capacity, 16);
    }

    #[test]
    fn rejects_bad_values() {
        let err = ShigotoConfig::from_lookup(lookup(&[("SHIGOTO_MAX_WORKERS", "many")]));
        assert!(matches!(
            err,
            Err(ConfigError::Invalid { key: "SHIGOTO_MAX_WORKERS", .. })
        ));
        assert!(ShigotoConfig::from_lookup(lookup(&[("SHIGOTO_PAUSE_POLICY", "never")])).is_err());
        assert!(ShigotoConfig::from_lookup(lookup(&[("SHIGOTO_EVENT_CAPACITY", "0")])).is_err());
    }

    #[test]
    fn deserializes_partial_json() {
        let cfg: ShigotoConfig =
            serde_json::from_str(r#"{"max_workers": 4, "pause_policy": "after_read"}"#).unwrap();
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.pause_policy, PausePolicy::AfterRead);
        assert_eq!(cfg.default_queue, "default");
    }
}
