//! Heartbeat monitor with a background check loop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock, Weak, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use taskforge_core::{ConfigError, ConfigResult, SharedClock, SystemClock, WorkerId};

use crate::worker::{WorkerInfo, WorkerStatus};

/// Callback fired on a liveness transition.
pub type WorkerCallback = Arc<dyn Fn(&WorkerInfo) + Send + Sync>;

/// Heartbeat monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Silence longer than this marks a worker dead
    pub heartbeat_timeout: Duration,
    /// How often the background loop evaluates liveness
    pub check_interval: Duration,
    /// Name for the check thread and logs
    pub name: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(10),
            name: "heartbeat-monitor".to_string(),
        }
    }
}

impl HeartbeatConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::invalid("heartbeat_timeout", "must be positive"));
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::invalid("check_interval", "must be positive"));
        }
        Ok(())
    }
}

/// Handle to the background check thread.
#[derive(Debug)]
struct CheckerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

/// Tracks worker liveness from periodic heartbeats.
///
/// A worker is dead once its last heartbeat is older than
/// `heartbeat_timeout` at a check tick. Dead and recovered callbacks fire
/// once per transition, never once per tick. Callbacks run after the
/// worker table lock is released; the dead callback runs on the check
/// thread, the recovered callback on the thread delivering the heartbeat.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    clock: SharedClock,
    workers: RwLock<HashMap<WorkerId, WorkerInfo>>,
    on_dead: RwLock<Option<WorkerCallback>>,
    on_recovered: RwLock<Option<WorkerCallback>>,
    checker: Mutex<Option<CheckerHandle>>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("config", &self.config)
            .field("workers", &self.worker_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: HeartbeatConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            workers: RwLock::new(HashMap::new()),
            on_dead: RwLock::new(None),
            on_recovered: RwLock::new(None),
            checker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Register a callback for alive -> dead transitions. Replaces any
    /// previous registration.
    ///
    /// Runs on the thread executing [`check_workers`](Self::check_workers),
    /// normally the background check thread. A death overtaken by a newer
    /// heartbeat before delivery is not reported.
    pub fn on_worker_dead<F>(&self, callback: F)
    where
        F: Fn(&WorkerInfo) + Send + Sync + 'static,
    {
        *self.on_dead.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Register a callback for dead -> alive transitions. Replaces any
    /// previous registration.
    ///
    /// Runs synchronously on the thread that delivered the recovering
    /// [`heartbeat`](Self::heartbeat) (or re-registration), not on the check
    /// thread. That call does not return until the callback does, so keep
    /// the callback short or hand the work off.
    pub fn on_worker_recovered<F>(&self, callback: F)
    where
        F: Fn(&WorkerInfo) + Send + Sync + 'static,
    {
        *self.on_recovered.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Start tracking a worker as alive.
    ///
    /// Registering a known worker counts as a heartbeat that keeps its last
    /// reported load, so a dead worker re-registering still fires the
    /// recovered callback.
    pub fn register_worker(&self, id: impl Into<WorkerId>) {
        let id = id.into();
        let existing = {
            let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
            workers.get(&id).map(|w| (w.load, w.active_tasks))
        };

        match existing {
            Some((load, active_tasks)) => self.heartbeat(id, load, active_tasks),
            None => {
                let now = self.clock.now();
                let wall = self.clock.utc_now();
                let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
                workers
                    .entry(id.clone())
                    .or_insert_with(|| WorkerInfo::new(id.clone(), now, wall));
                info!(monitor = %self.config.name, worker_id = %id, "worker registered");
            }
        }
    }

    /// Stop tracking a worker. No callbacks fire for it afterwards.
    pub fn unregister_worker(&self, id: &WorkerId) -> Option<WorkerInfo> {
        let removed = self
            .workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if removed.is_some() {
            info!(monitor = %self.config.name, worker_id = %id, "worker unregistered");
        }
        removed
    }

    /// Record a heartbeat. Unknown workers are registered implicitly.
    pub fn heartbeat(&self, id: impl Into<WorkerId>, load: f64, active_tasks: u32) {
        let id = id.into();
        let now = self.clock.now();
        let wall = self.clock.utc_now();

        let recovered = {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            let info = workers.entry(id.clone()).or_insert_with(|| {
                debug!(monitor = %self.config.name, worker_id = %id, "auto-registering worker on first heartbeat");
                WorkerInfo::new(id.clone(), now, wall)
            });

            info.last_heartbeat = now;
            info.last_seen = wall;
            info.load = load;
            info.active_tasks = active_tasks;
            info.missed_heartbeats = 0;

            if info.alive {
                None
            } else {
                info.set_alive(true);
                Some(info.clone())
            }
        };

        if let Some(info) = recovered {
            if self.is_current(&info) {
                info!(monitor = %self.config.name, worker_id = %info.id, "worker recovered");
                self.fire(&self.on_recovered, &info);
            }
        }
    }

    /// Run one liveness pass. Returns the workers that just died.
    ///
    /// Called by the background loop every `check_interval`; exposed so the
    /// owner (or a test driving a manual clock) can force a pass.
    pub fn check_workers(&self) -> Vec<WorkerId> {
        let now = self.clock.now();
        let timeout = self.config.heartbeat_timeout;

        let newly_dead: Vec<WorkerInfo> = {
            let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
            let mut dead = Vec::new();
            for info in workers.values_mut() {
                if info.silence(now) > timeout {
                    info.missed_heartbeats = info.missed_heartbeats.saturating_add(1);
                    if info.alive {
                        info.set_alive(false);
                        dead.push(info.clone());
                    }
                }
            }
            dead
        };

        let mut ids = Vec::with_capacity(newly_dead.len());
        for info in newly_dead {
            // Unregistered, or recovered by a heartbeat, since the pass.
            if !self.is_current(&info) {
                debug!(monitor = %self.config.name, worker_id = %info.id, "dropping stale dead transition");
                continue;
            }
            warn!(
                monitor = %self.config.name,
                worker_id = %info.id,
                silent_ms = info.silence(now).as_millis() as u64,
                "worker missed heartbeat deadline, marking dead"
            );
            self.fire(&self.on_dead, &info);
            ids.push(info.id);
        }
        ids
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn is_alive(&self, id: &WorkerId) -> bool {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|w| w.alive)
    }

    pub fn worker(&self, id: &WorkerId) -> Option<WorkerInfo> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Alive worker ids, sorted.
    pub fn alive_workers(&self) -> Vec<WorkerId> {
        self.ids_where(|w| w.alive)
    }

    /// Dead worker ids, sorted.
    pub fn dead_workers(&self) -> Vec<WorkerId> {
        self.ids_where(|w| !w.alive)
    }

    /// Status of every worker, sorted by id.
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = workers.values().map(WorkerInfo::status).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Alive worker with the lowest load; ties go to fewer active tasks, then id.
    pub fn least_loaded_worker(&self) -> Option<WorkerId> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers
            .values()
            .filter(|w| w.alive)
            .min_by(|a, b| {
                a.load
                    .total_cmp(&b.load)
                    .then(a.active_tasks.cmp(&b.active_tasks))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|w| w.id.clone())
    }

    /// Spawn the background check thread. Returns `false` if already running.
    ///
    /// The thread holds only a weak reference; dropping the last `Arc` to
    /// the monitor also ends the loop.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut checker = self.checker.lock().unwrap_or_else(|e| e.into_inner());
        if checker.is_some() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let monitor = Arc::downgrade(self);
        let name = self.config.name.clone();
        let interval = self.config.check_interval;

        let join = match thread::Builder::new()
            .name(name.clone())
            .spawn(move || check_loop(name, monitor, interval, shutdown_rx))
        {
            Ok(join) => join,
            Err(err) => {
                error!(monitor = %self.config.name, error = %err, "failed to spawn heartbeat check thread");
                return false;
            }
        };

        *checker = Some(CheckerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        });
        true
    }

    pub fn is_running(&self) -> bool {
        self.checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop the check loop and wait for it to exit.
    ///
    /// A callback that is currently running is allowed to finish. Safe to
    /// call from inside a callback (the thread is then not joined).
    pub fn shutdown(&self) {
        let handle = self
            .checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(mut handle) = handle {
            let _ = handle.shutdown.send(());
            if let Some(join) = handle.join.take() {
                if join.thread().id() != thread::current().id() {
                    let _ = join.join();
                }
            }
        }
    }

    /// Whether `info` still describes the worker's latest liveness flip.
    fn is_current(&self, info: &WorkerInfo) -> bool {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&info.id)
            .is_some_and(|w| w.generation == info.generation)
    }

    fn ids_where(&self, pred: impl Fn(&WorkerInfo) -> bool) -> Vec<WorkerId> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = workers
            .values()
            .filter(|w| pred(w))
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn fire(&self, slot: &RwLock<Option<WorkerCallback>>, info: &WorkerInfo) {
        let callback = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback(info))).is_err() {
                error!(monitor = %self.config.name, worker_id = %info.id, "worker callback panicked");
            }
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        // The loop may be the one dropping the last Arc; never join here.
        if let Some(handle) = self.checker.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.shutdown.send(());
        }
    }
}

fn check_loop(
    name: String,
    monitor: Weak<HeartbeatMonitor>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
) {
    info!(monitor = %name, interval_ms = interval.as_millis() as u64, "heartbeat monitor started");

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        monitor.check_workers();
    }

    info!(monitor = %name, "heartbeat monitor stopped");
}
