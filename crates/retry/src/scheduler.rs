//! Timer-driven retries that never park a caller thread.
//!
//! [`RetryScheduler`] owns a small tokio runtime that acts as the retry
//! timer. Submitted actions run their backoff loop there and report back
//! through a [`ScheduledRetry`] handle.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use taskforge_breaker::CircuitBreaker;

use crate::error::RetryError;
use crate::executor::{RetryExecutor, RetryResult};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct RetrySchedulerConfig {
    /// Thread name prefix, also used in logs
    pub name: String,
    /// Runtime worker threads
    pub worker_threads: usize,
    /// How long `shutdown` waits for in-flight attempts to finish
    pub shutdown_grace: Duration,
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            name: "retry-scheduler".to_string(),
            worker_threads: 2,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl RetrySchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Handle to the eventual result of a scheduled retry.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread. If the scheduler goes away before the execution reports back the
/// result is [`RetryError::Cancelled`].
#[derive(Debug)]
pub struct ScheduledRetry<T, E> {
    rx: oneshot::Receiver<RetryResult<T, E>>,
}

impl<T, E> ScheduledRetry<T, E> {
    /// Block the current thread until the execution finishes.
    ///
    /// Must not be called from within an async context.
    pub fn wait(self) -> RetryResult<T, E> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(RetryError::Cancelled { attempts: 0 }))
    }
}

impl<T, E> Future for ScheduledRetry<T, E> {
    type Output = RetryResult<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(RetryError::Cancelled { attempts: 0 })))
    }
}

/// Counts executions that have not reported back yet.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        InFlightGuard(self.clone())
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if everything drained within `timeout`.
    fn wait_drained(&self, timeout: Duration) -> bool {
        let guard = self.count.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .drained
            .wait_timeout_while(guard, timeout, |n| *n > 0)
            .unwrap_or_else(|e| e.into_inner());
        *guard == 0
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

/// Runs retried actions on a dedicated timer runtime.
pub struct RetryScheduler {
    executor: RetryExecutor,
    config: RetrySchedulerConfig,
    runtime: Option<Runtime>,
    shutdown: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
}

impl std::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryScheduler")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.current())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

impl RetryScheduler {
    /// Build the scheduler and its runtime.
    pub fn new(executor: RetryExecutor, config: RetrySchedulerConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name(config.name.clone())
            .enable_time()
            .build()?;
        let (shutdown, _) = watch::channel(false);

        info!(scheduler = %config.name, "retry scheduler started");

        Ok(Self {
            executor,
            config,
            runtime: Some(runtime),
            shutdown,
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// Executions that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Schedule `action` with the executor's backoff policy.
    ///
    /// Returns immediately. Submissions made after shutdown has begun resolve
    /// to [`RetryError::Cancelled`] without invoking the action.
    pub fn submit<T, E, F, Fut>(
        &self,
        action: F,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> ScheduledRetry<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let Some(runtime) = self.runtime.as_ref() else {
            let _ = tx.send(Err(RetryError::Cancelled { attempts: 0 }));
            return ScheduledRetry { rx };
        };

        let executor = self.executor.clone();
        let stop = self.shutdown.subscribe();
        let guard = self.in_flight.enter();

        runtime.spawn(async move {
            let _guard = guard;
            let result = executor.run_async(action, breaker.as_deref(), Some(stop)).await;
            if tx.send(result).is_err() {
                debug!("scheduled retry finished after its handle was dropped");
            }
        });

        ScheduledRetry { rx }
    }

    /// Stop scheduling new attempts.
    ///
    /// Pending backoff waits resolve to [`RetryError::Cancelled`]; attempts
    /// already running are left to finish.
    pub fn begin_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(scheduler = %self.config.name, "retry scheduler stopping");
        }
    }

    /// Signal shutdown, give in-flight attempts up to the grace period, then
    /// stop the runtime.
    pub fn shutdown(mut self) {
        self.begin_shutdown();
        if !self.in_flight.wait_drained(self.config.shutdown_grace) {
            warn!(
                scheduler = %self.config.name,
                remaining = self.in_flight.current(),
                "retry scheduler grace period elapsed with attempts still running"
            );
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.config.shutdown_grace);
        }
        info!(scheduler = %self.config.name, "retry scheduler stopped");
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.shutdown.send_replace(true);
            runtime.shutdown_background();
        }
    }
}
