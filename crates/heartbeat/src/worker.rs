//! Per-worker liveness record.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use taskforge_core::WorkerId;

/// Liveness and load as last reported by a worker.
///
/// Values handed out by the monitor are snapshots; mutating them has no
/// effect on the monitor.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// Monotonic time of the last heartbeat (or registration)
    pub last_heartbeat: Instant,
    /// Wall-clock time of the last heartbeat, for display
    pub last_seen: DateTime<Utc>,
    pub alive: bool,
    /// Check ticks that found the heartbeat overdue since the last heartbeat
    pub missed_heartbeats: u32,
    /// Reported load gauge (usually 0.0-1.0)
    pub load: f64,
    pub active_tasks: u32,
    /// Bumped on every alive/dead flip; stale callbacks are dropped by it
    pub(crate) generation: u64,
}

impl WorkerInfo {
    pub(crate) fn new(id: WorkerId, now: Instant, wall: DateTime<Utc>) -> Self {
        Self {
            id,
            last_heartbeat: now,
            last_seen: wall,
            alive: true,
            missed_heartbeats: 0,
            load: 0.0,
            active_tasks: 0,
            generation: 0,
        }
    }

    /// Flip liveness and start a new generation.
    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.alive = alive;
        self.generation += 1;
    }

    /// Time since the last heartbeat, as of `now`.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id.clone(),
            alive: self.alive,
            last_seen: self.last_seen,
            missed_heartbeats: self.missed_heartbeats,
            load: self.load,
            active_tasks: self.active_tasks,
        }
    }
}

/// Serializable view of a worker, for status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub alive: bool,
    pub last_seen: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub load: f64,
    pub active_tasks: u32,
}
