//! Terminal outcomes of a retried execution.

use thiserror::Error;

/// The single error a caller sees once a retried execution gives up.
///
/// Intermediate attempt failures are only logged. `attempts` always counts
/// how many times the action itself was invoked.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The circuit breaker rejected a call. Never retried.
    #[error("circuit breaker '{name}' is open (after {attempts} attempt(s))")]
    CircuitOpen { name: String, attempts: u32 },

    /// Every permitted attempt failed; carries the last underlying error.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// Cancelled while waiting between attempts.
    #[error("retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::CircuitOpen { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last error returned by the action, when retries ran out.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}
