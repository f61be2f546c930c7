//! Per-dependency circuit breaker.
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN --(request after open_duration since last failure)--> HALF_OPEN
//! HALF_OPEN --(success_threshold consecutive successes)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```
//!
//! All state lives in atomics. The wrapped action runs outside any critical
//! section, so a slow call never blocks another caller's admission check.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskforge_core::{ConfigError, ConfigResult, SharedClock, SystemClock};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Requests pass through.
    Closed = 0,
    /// Requests are rejected without invoking the action.
    Open = 1,
    /// Requests pass through as trial requests.
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while closed) that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) that close the breaker.
    pub success_threshold: u32,
    /// Cooldown measured from the last recorded failure.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be at least 1"));
        }
        Ok(())
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call; the action was not invoked.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    /// The action ran and failed. The original error is preserved.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The action's own error, if the action ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure, if any.
    pub last_failure_age_ms: Option<u64>,
}

/// Failure-rate state machine guarding a single dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    origin: Instant,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// Nanoseconds since `origin` of the last failure, plus one. Zero means none.
    last_failure: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .field("success_count", &self.success_count())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    ///
    /// Thresholds below 1 are treated as 1.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    pub fn with_clock(
        name: impl Into<String>,
        mut config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        config.success_threshold = config.success_threshold.max(1);
        let origin = clock.now();
        Self {
            name: name.into(),
            config,
            clock,
            origin,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn success_count(&self) -> u32 {
        self.success_count.load(Ordering::Acquire)
    }

    /// Decide whether a request may proceed.
    ///
    /// Performs the OPEN -> HALF_OPEN transition once the cooldown has
    /// elapsed. Only one caller wins the swap; every caller that observed the
    /// expired cooldown is admitted as a trial request.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if !self.cooldown_elapsed() {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.success_count.store(0, Ordering::Release);
                    info!(breaker = %self.name, "circuit breaker half-open, probing");
                }
                true
            }
        }
    }

    /// Run `action` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] without calling `action` when the
    /// breaker rejects the request. Otherwise the action's outcome is
    /// recorded and its error, if any, is handed back untouched.
    pub fn execute<T, E, F>(&self, action: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.allow_request() {
            debug!(breaker = %self.name, "request rejected by open circuit breaker");
            return Err(self.open_error());
        }

        match action() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Async counterpart of [`execute`](Self::execute).
    ///
    /// `action` is only called, and its future only created, once the
    /// request has been admitted.
    pub async fn execute_async<T, E, F, Fut>(&self, action: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow_request() {
            debug!(breaker = %self.name, "request rejected by open circuit breaker");
            return Err(self.open_error());
        }

        match action().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.failure_count.store(0, Ordering::Release);
                    self.success_count.store(0, Ordering::Release);
                    info!(breaker = %self.name, successes, "circuit breaker closed");
                }
            }
            // A call admitted before the breaker opened finished late.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.last_failure
            .store(self.elapsed_nanos().saturating_add(1), Ordering::Release);

        match self.state() {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self.transition(CircuitState::Closed, CircuitState::Open)
                {
                    warn!(
                        breaker = %self.name,
                        failures,
                        open_for_ms = self.config.open_duration.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.success_count.store(0, Ordering::Release);
                    warn!(breaker = %self.name, "trial request failed, circuit breaker re-opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force CLOSED with zeroed counters.
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        self.last_failure.store(0, Ordering::Release);
        info!(breaker = %self.name, "circuit breaker reset");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            success_count: self.success_count(),
            last_failure_age_ms: self
                .last_failure_age()
                .map(|age| age.as_millis() as u64),
        }
    }

    /// Time since the last recorded failure, if any.
    pub fn last_failure_age(&self) -> Option<Duration> {
        let raw = self.last_failure.load(Ordering::Acquire);
        if raw == 0 {
            return None;
        }
        let at = raw - 1;
        Some(Duration::from_nanos(self.elapsed_nanos().saturating_sub(at)))
    }

    fn cooldown_elapsed(&self) -> bool {
        match self.last_failure_age() {
            Some(age) => age >= self.config.open_duration,
            None => true,
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn elapsed_nanos(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX - 1)
    }

    fn open_error<E>(&self) -> BreakerError<E> {
        BreakerError::Open {
            name: self.name.clone(),
        }
    }
}
