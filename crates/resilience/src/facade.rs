//! One object wiring the four primitives together.

use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use taskforge_breaker::{CircuitBreaker, CircuitBreakerRegistry};
use taskforge_checkpoint::{CheckpointError, CheckpointManager};
use taskforge_core::{ConfigError, SharedClock, SystemClock};
use taskforge_heartbeat::HeartbeatMonitor;
use taskforge_retry::{RetryExecutor, RetryResult, RetryScheduler, RetrySchedulerConfig};

use crate::config::ResilienceConfig;

/// Failure while assembling [`Resilience`].
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Breakers per dependency, a shared retry policy, a heartbeat monitor and
/// a checkpoint manager built from one [`ResilienceConfig`].
///
/// The components stay independent; this type only owns them and offers
/// [`call`](Self::call) for the common "retry through the dependency's
/// breaker" case.
#[derive(Debug)]
pub struct Resilience {
    breakers: CircuitBreakerRegistry,
    retry: RetryExecutor,
    heartbeat: Arc<HeartbeatMonitor>,
    checkpoints: CheckpointManager,
}

impl Resilience {
    pub fn new(config: &ResilienceConfig) -> Result<Self, ResilienceError> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Build every component on `clock`.
    pub fn with_clock(config: &ResilienceConfig, clock: SharedClock) -> Result<Self, ResilienceError> {
        config.validate()?;

        let checkpoints =
            CheckpointManager::open(config.checkpoint.resolved_dir())?.with_clock(clock.clone());

        let resilience = Self {
            breakers: CircuitBreakerRegistry::with_clock(config.breaker_config(), clock.clone()),
            retry: RetryExecutor::new(config.retry_config()),
            heartbeat: Arc::new(HeartbeatMonitor::with_clock(config.heartbeat_config(), clock)),
            checkpoints,
        };
        info!(
            failure_threshold = config.breaker.failure_threshold,
            max_retries = config.retry.max_retries,
            heartbeat_timeout_ms = config.heartbeat.timeout_ms,
            "resilience layer ready"
        );
        Ok(resilience)
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Breaker guarding `dependency`, created on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(dependency)
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Run `action` against `dependency` with retries, through that
    /// dependency's breaker. Blocks between attempts.
    pub fn call<T, E, F>(&self, dependency: &str, action: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        let breaker = self.breaker(dependency);
        self.retry.execute(action, Some(&breaker))
    }

    /// Async [`call`](Self::call).
    pub async fn call_async<T, E, F, Fut>(&self, dependency: &str, action: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let breaker = self.breaker(dependency);
        self.retry.execute_async(action, Some(&breaker)).await
    }

    /// A timer-driven scheduler sharing this layer's retry policy.
    pub fn scheduler(&self, config: RetrySchedulerConfig) -> std::io::Result<RetryScheduler> {
        RetryScheduler::new(self.retry.clone(), config)
    }

    /// Start the background heartbeat check loop.
    pub fn start(&self) -> bool {
        self.heartbeat.start()
    }

    /// Stop background work. Durable checkpoints are untouched.
    pub fn shutdown(&self) {
        self.heartbeat.shutdown();
        info!("resilience layer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_in(dir: &std::path::Path) -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.checkpoint.dir = Some(dir.to_path_buf());
        config
    }

    #[test]
    fn invalid_config_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target: PathBuf = dir.path().join("never-created");
        let mut config = config_in(&target);
        config.retry.multiplier = 0.5;

        let err = Resilience::new(&config).unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
        assert!(!target.exists());
    }

    #[test]
    fn breakers_are_shared_per_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let resilience = Resilience::new(&config_in(dir.path())).unwrap();

        let a = resilience.breaker("billing");
        let b = resilience.breaker("billing");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(resilience.breakers().len(), 1);
    }

    #[test]
    fn call_succeeds_first_try() {
        let dir = tempfile::tempdir().unwrap();
        let resilience = Resilience::new(&config_in(dir.path())).unwrap();

        let out: RetryResult<u32, String> = resilience.call("db", || Ok(7));
        assert_eq!(out.unwrap(), 7);
    }

    #[test]
    fn start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let resilience = Resilience::new(&config_in(dir.path())).unwrap();
        assert!(resilience.start());
        assert!(resilience.heartbeat().is_running());
        resilience.shutdown();
        assert!(!resilience.heartbeat().is_running());
    }
}
