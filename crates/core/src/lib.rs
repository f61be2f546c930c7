//! `taskforge-core`: shared building blocks for the resilience crates.
//!
//! This crate holds identifiers, the injectable clock and the configuration
//! error type. It has no I/O and no background work.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ConfigError, ConfigResult};
pub use id::{TaskId, WorkerId};
