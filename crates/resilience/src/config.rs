//! Aggregate configuration for the resilience layer.
//!
//! Durations are plain milliseconds so the same shape works in a JSON file
//! and in `TASKFORGE_*` environment variables.
//!
//! ```json
//! {
//!   "breaker":    { "failure_threshold": 5, "success_threshold": 3, "open_duration_ms": 30000 },
//!   "retry":      { "max_retries": 3, "initial_delay_ms": 100, "multiplier": 2.0,
//!                   "max_delay_ms": 10000, "jitter_factor": 0.1 },
//!   "heartbeat":  { "timeout_ms": 30000, "check_interval_ms": 10000 },
//!   "checkpoint": { "dir": "/var/lib/taskforge/checkpoints" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use taskforge_breaker::CircuitBreakerConfig;
use taskforge_checkpoint::FileCheckpointStore;
use taskforge_core::{ConfigError, ConfigResult};
use taskforge_heartbeat::HeartbeatConfig;
use taskforge_retry::RetryConfig;

/// Prefix of every environment variable read by [`ResilienceConfig::from_env`].
pub const ENV_PREFIX: &str = "TASKFORGE_";

/// Top-level configuration. Missing sections and fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub heartbeat: HeartbeatSettings,
    pub checkpoint: CheckpointSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let d = CircuitBreakerConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            success_threshold: d.success_threshold,
            open_duration_ms: millis(d.open_duration),
        }
    }
}

impl From<&BreakerSettings> for CircuitBreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        CircuitBreakerConfig::default()
            .with_failure_threshold(s.failure_threshold)
            .with_success_threshold(s.success_threshold)
            .with_open_duration(Duration::from_millis(s.open_duration_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_retries: d.max_retries,
            initial_delay_ms: millis(d.initial_delay),
            multiplier: d.multiplier,
            max_delay_ms: millis(d.max_delay),
            jitter_factor: d.jitter_factor,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig::default()
            .with_max_retries(s.max_retries)
            .with_initial_delay(Duration::from_millis(s.initial_delay_ms))
            .with_multiplier(s.multiplier)
            .with_max_delay(Duration::from_millis(s.max_delay_ms))
            .with_jitter(s.jitter_factor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSettings {
    pub timeout_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        let d = HeartbeatConfig::default();
        Self {
            timeout_ms: millis(d.heartbeat_timeout),
            check_interval_ms: millis(d.check_interval),
        }
    }
}

impl From<&HeartbeatSettings> for HeartbeatConfig {
    fn from(s: &HeartbeatSettings) -> Self {
        HeartbeatConfig::default()
            .with_timeout(Duration::from_millis(s.timeout_ms))
            .with_check_interval(Duration::from_millis(s.check_interval_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointSettings {
    /// Checkpoint directory; the system temp dir is used when unset
    pub dir: Option<PathBuf>,
}

impl CheckpointSettings {
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(FileCheckpointStore::default_dir)
    }
}

impl ResilienceConfig {
    /// Parse from a JSON document. Does not validate.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Defaults overridden by `TASKFORGE_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `TASKFORGE_BREAKER_FAILURE_THRESHOLD` | `breaker.failure_threshold` |
    /// | `TASKFORGE_BREAKER_SUCCESS_THRESHOLD` | `breaker.success_threshold` |
    /// | `TASKFORGE_BREAKER_OPEN_DURATION_MS` | `breaker.open_duration_ms` |
    /// | `TASKFORGE_RETRY_MAX_RETRIES` | `retry.max_retries` |
    /// | `TASKFORGE_RETRY_INITIAL_DELAY_MS` | `retry.initial_delay_ms` |
    /// | `TASKFORGE_RETRY_MULTIPLIER` | `retry.multiplier` |
    /// | `TASKFORGE_RETRY_MAX_DELAY_MS` | `retry.max_delay_ms` |
    /// | `TASKFORGE_RETRY_JITTER_FACTOR` | `retry.jitter_factor` |
    /// | `TASKFORGE_HEARTBEAT_TIMEOUT_MS` | `heartbeat.timeout_ms` |
    /// | `TASKFORGE_HEARTBEAT_CHECK_INTERVAL_MS` | `heartbeat.check_interval_ms` |
    /// | `TASKFORGE_CHECKPOINT_DIR` | `checkpoint.dir` |
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        env.set("BREAKER_FAILURE_THRESHOLD", "breaker.failure_threshold", &mut config.breaker.failure_threshold)?;
        env.set("BREAKER_SUCCESS_THRESHOLD", "breaker.success_threshold", &mut config.breaker.success_threshold)?;
        env.set("BREAKER_OPEN_DURATION_MS", "breaker.open_duration_ms", &mut config.breaker.open_duration_ms)?;

        env.set("RETRY_MAX_RETRIES", "retry.max_retries", &mut config.retry.max_retries)?;
        env.set("RETRY_INITIAL_DELAY_MS", "retry.initial_delay_ms", &mut config.retry.initial_delay_ms)?;
        env.set("RETRY_MULTIPLIER", "retry.multiplier", &mut config.retry.multiplier)?;
        env.set("RETRY_MAX_DELAY_MS", "retry.max_delay_ms", &mut config.retry.max_delay_ms)?;
        env.set("RETRY_JITTER_FACTOR", "retry.jitter_factor", &mut config.retry.jitter_factor)?;

        env.set("HEARTBEAT_TIMEOUT_MS", "heartbeat.timeout_ms", &mut config.heartbeat.timeout_ms)?;
        env.set("HEARTBEAT_CHECK_INTERVAL_MS", "heartbeat.check_interval_ms", &mut config.heartbeat.check_interval_ms)?;

        if let Some(dir) = env.get("CHECKPOINT_DIR") {
            config.checkpoint.dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    /// Check every section against its component's rules.
    pub fn validate(&self) -> ConfigResult<()> {
        self.breaker_config().validate()?;
        self.retry_config().validate()?;
        self.heartbeat_config().validate()?;
        if matches!(&self.checkpoint.dir, Some(dir) if dir.as_os_str().is_empty()) {
            return Err(ConfigError::invalid("checkpoint.dir", "must not be empty"));
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        (&self.breaker).into()
    }

    pub fn retry_config(&self) -> RetryConfig {
        (&self.retry).into()
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        (&self.heartbeat).into()
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn set<T: FromStr>(&self, suffix: &str, field: &'static str, slot: &mut T) -> ConfigResult<()>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(suffix) {
            *slot = raw.parse().map_err(|e: T::Err| {
                ConfigError::invalid(field, format!("{ENV_PREFIX}{suffix}={raw:?}: {e}"))
            })?;
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_components() {
        let config = ResilienceConfig::default();
        assert_eq!(config.breaker_config(), CircuitBreakerConfig::default());
        assert_eq!(config.retry_config(), RetryConfig::default());
        assert_eq!(config.heartbeat_config().heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat_config().check_interval, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ResilienceConfig::from_json(
            r#"{ "breaker": { "failure_threshold": 2 }, "retry": { "max_retries": 0 } }"#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.success_threshold, 3);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.heartbeat, HeartbeatSettings::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ResilienceConfig::from_json(r#"{ "retry": { "max_retry": 3 } }"#);
        assert!(err.is_err());
    }

    #[test]
    fn env_overrides_defaults() {
        let config = ResilienceConfig::from_lookup(lookup(&[
            ("TASKFORGE_BREAKER_OPEN_DURATION_MS", "500"),
            ("TASKFORGE_RETRY_MULTIPLIER", "1.5"),
            ("TASKFORGE_HEARTBEAT_TIMEOUT_MS", " 2000 "),
            ("TASKFORGE_CHECKPOINT_DIR", "/tmp/cp"),
            ("UNRELATED", "x"),
        ]))
        .unwrap();

        assert_eq!(config.breaker.open_duration_ms, 500);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.heartbeat.timeout_ms, 2000);
        assert_eq!(config.checkpoint.resolved_dir(), PathBuf::from("/tmp/cp"));
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn bad_env_value_names_the_field() {
        let err = ResilienceConfig::from_lookup(lookup(&[("TASKFORGE_RETRY_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { field: "retry.max_retries", .. }
        ));
    }

    #[test]
    fn validate_catches_component_errors() {
        let mut config = ResilienceConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.heartbeat.check_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ResilienceConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_uses_millis() {
        let json = serde_json::to_value(ResilienceConfig::default()).unwrap();
        assert_eq!(json["breaker"]["open_duration_ms"], 30_000);
        assert_eq!(json["retry"]["max_delay_ms"], 10_000);
        assert!(json["checkpoint"]["dir"].is_null());
    }
}
