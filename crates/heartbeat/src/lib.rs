//! `taskforge-heartbeat`: worker liveness from periodic heartbeats.
//!
//! Workers call [`HeartbeatMonitor::heartbeat`] on a fixed interval shorter
//! than the configured timeout. A background loop classifies workers as
//! alive or dead and fires edge-triggered callbacks that a scheduler uses to
//! take workers in and out of rotation. A late heartbeat is normal
//! operation, so nothing here returns an error.

pub mod monitor;
pub mod worker;

pub use monitor::{HeartbeatConfig, HeartbeatMonitor, WorkerCallback};
pub use worker::{WorkerInfo, WorkerStatus};
