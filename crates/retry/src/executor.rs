//! Retry executor: blocking and async flavours of the same backoff loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use taskforge_breaker::{BreakerError, CircuitBreaker};

use crate::cancel::CancelToken;
use crate::error::RetryError;
use crate::policy::RetryConfig;

/// Result of a retried execution.
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Wraps actions with capped exponential backoff and jitter.
///
/// Holds only immutable configuration; every call owns its attempt counter,
/// so one executor can be shared freely across threads.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

enum Next<E> {
    Wait(Duration),
    GiveUp(RetryError<E>),
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `action` until it succeeds, the breaker opens, or retries run out.
    ///
    /// Blocks the calling thread between attempts.
    pub fn execute<T, E, F>(&self, action: F, breaker: Option<&CircuitBreaker>) -> RetryResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        self.execute_with_cancel(action, breaker, &CancelToken::new())
    }

    /// Like [`execute`](Self::execute), but a cancelled `cancel` token aborts
    /// the current backoff wait with [`RetryError::Cancelled`].
    pub fn execute_with_cancel<T, E, F>(
        &self,
        mut action: F,
        breaker: Option<&CircuitBreaker>,
        cancel: &CancelToken,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts });
            }

            let outcome = match breaker {
                Some(cb) => cb.execute(&mut action),
                None => action().map_err(BreakerError::Inner),
            };

            match outcome {
                Ok(value) => {
                    self.log_success(attempts);
                    return Ok(value);
                }
                Err(BreakerError::Open { name }) => {
                    return Err(Self::circuit_open(name, attempts));
                }
                Err(BreakerError::Inner(err)) => {
                    attempts += 1;
                    match self.after_failure(attempts, err) {
                        Next::Wait(delay) => {
                            if !cancel.sleep(delay) {
                                debug!(attempts, "retry cancelled during backoff");
                                return Err(RetryError::Cancelled { attempts });
                            }
                        }
                        Next::GiveUp(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Async variant: awaits a timer between attempts instead of blocking.
    pub async fn execute_async<T, E, F, Fut>(
        &self,
        action: F,
        breaker: Option<&CircuitBreaker>,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_async(action, breaker, None).await
    }

    /// Shared async loop. When `shutdown` flips to `true` (or its sender is
    /// dropped) no further attempt is started and any pending wait resolves
    /// to [`RetryError::Cancelled`]. An attempt already running is not
    /// interrupted.
    pub(crate) async fn run_async<T, E, F, Fut>(
        &self,
        mut action: F,
        breaker: Option<&CircuitBreaker>,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempts = 0u32;

        loop {
            if let Some(rx) = shutdown.as_ref() {
                let stopping = *rx.borrow();
                if stopping {
                    return Err(RetryError::Cancelled { attempts });
                }
            }

            let outcome = match breaker {
                Some(cb) => cb.execute_async(&mut action).await,
                None => action().await.map_err(BreakerError::Inner),
            };

            match outcome {
                Ok(value) => {
                    self.log_success(attempts);
                    return Ok(value);
                }
                Err(BreakerError::Open { name }) => {
                    return Err(Self::circuit_open(name, attempts));
                }
                Err(BreakerError::Inner(err)) => {
                    attempts += 1;
                    let delay = match self.after_failure(attempts, err) {
                        Next::Wait(delay) => delay,
                        Next::GiveUp(err) => return Err(err),
                    };

                    match shutdown.as_mut() {
                        Some(rx) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = stopped(rx) => {
                                    debug!(attempts, "scheduled retry cancelled by shutdown");
                                    return Err(RetryError::Cancelled { attempts });
                                }
                            }
                        }
                        None => tokio::time::sleep(delay).await,
                    }
                }
            }
        }
    }

    fn after_failure<E: Display>(&self, attempts: u32, err: E) -> Next<E> {
        if attempts > self.config.max_retries {
            warn!(attempts, error = %err, "retries exhausted");
            return Next::GiveUp(RetryError::Exhausted {
                attempts,
                last_error: err,
            });
        }

        let delay = self.config.jittered_delay(attempts);
        debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, backing off"
        );
        Next::Wait(delay)
    }

    fn circuit_open<E>(name: String, attempts: u32) -> RetryError<E> {
        warn!(breaker = %name, attempts, "circuit open, not retrying");
        RetryError::CircuitOpen { name, attempts }
    }

    fn log_success(&self, attempts: u32) {
        if attempts > 0 {
            debug!(retries = attempts, "succeeded after retrying");
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *rx.borrow();
        if stopping {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use taskforge_breaker::{CircuitBreakerConfig, CircuitState};
    use taskforge_core::ManualClock;

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig::fixed(max_retries, Duration::from_millis(1)))
    }

    #[test]
    fn always_failing_action_runs_max_retries_plus_one() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_retries(3)
                .with_initial_delay(Duration::from_millis(100))
                .with_multiplier(2.0)
                .with_max_delay(Duration::from_secs(10)),
        );
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), String> = executor.execute(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            },
            None,
        );

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.into_last_error().as_deref(), Some("failure 4"));
    }

    #[test]
    fn zero_retries_means_one_attempt() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<(), &str> = fast(0).execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            },
            None,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<u32, &str> = fast(5).execute(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err("transient") } else { Ok(n) }
            },
            None,
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn stops_as_soon_as_breaker_opens() {
        let breaker = CircuitBreaker::with_clock(
            "downstream",
            CircuitBreakerConfig::default().with_failure_threshold(2),
            ManualClock::shared(),
        );
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), &str> = fast(10).execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            },
            Some(&breaker),
        );

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.attempts(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_breaker_rejects_before_first_attempt() {
        let breaker = CircuitBreaker::with_clock(
            "downstream",
            CircuitBreakerConfig::default().with_failure_threshold(1),
            ManualClock::shared(),
        );
        breaker.record_failure();
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), &str> = fast(3).execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(&breaker),
        );

        assert_eq!(result.unwrap_err().attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_during_backoff_is_distinct() {
        let executor = RetryExecutor::new(RetryConfig::fixed(5, Duration::from_secs(30)));
        let token = CancelToken::new();
        let remote = token.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let started = Instant::now();

        let handle = std::thread::spawn(move || {
            executor.execute_with_cancel(
                || {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("slow dependency")
                },
                None,
                &token,
            )
        });

        std::thread::sleep(Duration::from_millis(50));
        remote.cancel();
        let err = handle.join().unwrap().unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn async_mode_matches_blocking_semantics() {
        let executor = RetryExecutor::new(RetryConfig::default().with_max_retries(3));
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), String> = executor
            .execute_async(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("still failing".to_string()) }
                },
                None,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(result.unwrap_err().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn async_mode_waits_backoff_on_timer() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_secs(1))
                .with_jitter(0.0),
        );
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: RetryResult<u32, &str> = executor
            .execute_async(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { if n < 3 { Err("later") } else { Ok(n) } }
                },
                None,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        // 1s + 2s of backoff on the paused clock.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3) && waited < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn async_mode_respects_breaker() {
        let breaker = CircuitBreaker::with_clock(
            "api",
            CircuitBreakerConfig::default().with_failure_threshold(1),
            ManualClock::shared(),
        );
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), &str> = RetryExecutor::default()
            .execute_async(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("boom") }
                },
                Some(&breaker),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn async_open_breaker_never_calls_action() {
        let breaker = CircuitBreaker::with_clock(
            "api",
            CircuitBreakerConfig::default().with_failure_threshold(1),
            ManualClock::shared(),
        );
        breaker.record_failure();
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), &str> = fast(3)
            .execute_async(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                Some(&breaker),
            )
            .await;

        let err = result.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
