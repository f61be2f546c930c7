//! `taskforge-breaker`: per-dependency circuit breakers.
//!
//! A breaker fails fast against a chronically failing dependency and gives it
//! time to recover before traffic resumes. See [`CircuitBreaker`] for the
//! state machine.

pub mod breaker;
pub mod registry;

pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
