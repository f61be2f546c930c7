//! `taskforge-retry`: retries with capped exponential backoff and jitter.
//!
//! ## Modes
//!
//! - Blocking: [`RetryExecutor::execute`] parks the calling thread between
//!   attempts; [`RetryExecutor::execute_with_cancel`] adds a [`CancelToken`].
//! - Async: [`RetryExecutor::execute_async`] awaits a tokio timer.
//! - Scheduled: [`RetryScheduler::submit`] runs the loop on a dedicated
//!   runtime and hands back a [`ScheduledRetry`].
//!
//! All modes share one backoff policy ([`RetryConfig`]) and the same circuit
//! breaker interaction: an open breaker ends the execution immediately with
//! [`RetryError::CircuitOpen`].

pub mod cancel;
pub mod error;
pub mod executor;
pub mod policy;
pub mod scheduler;

pub use cancel::CancelToken;
pub use error::RetryError;
pub use executor::{RetryExecutor, RetryResult};
pub use policy::RetryConfig;
pub use scheduler::{RetryScheduler, RetrySchedulerConfig, ScheduledRetry};
