//! Explicit, orchestrator-owned set of breakers keyed by dependency name.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use taskforge_core::{SharedClock, SystemClock};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};

/// One breaker per dependency, created on first use.
///
/// Not a global: whoever composes the resilience layer owns the registry and
/// hands out `Arc<CircuitBreaker>` to callers.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, creating it with the registry's config if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    name,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers.get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers.remove(name)
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        let mut snaps: Vec<_> = breakers.values().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }

    pub fn reset_all(&self) {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}
