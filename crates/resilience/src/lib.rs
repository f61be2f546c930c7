//! `taskforge-resilience`: configuration loading and a facade over the
//! breaker, retry, heartbeat and checkpoint crates.
//!
//! ```no_run
//! use taskforge_resilience::{Resilience, ResilienceConfig};
//!
//! # fn fetch() -> Result<String, std::io::Error> { Ok(String::new()) }
//! let config = ResilienceConfig::from_env()?;
//! let resilience = Resilience::new(&config)?;
//! resilience.start();
//!
//! let body = resilience.call("inventory-api", fetch);
//! # let _ = body;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod facade;

pub use config::{
    BreakerSettings, CheckpointSettings, ENV_PREFIX, HeartbeatSettings, ResilienceConfig,
    RetrySettings,
};
pub use facade::{Resilience, ResilienceError};

pub use taskforge_breaker as breaker;
pub use taskforge_checkpoint as checkpoint;
pub use taskforge_heartbeat as heartbeat;
pub use taskforge_retry as retry;

pub use taskforge_core::{
    Clock, ConfigError, ManualClock, SharedClock, SystemClock, TaskId, WorkerId,
};
