//! Checkpoint manager: durable store plus a read-through cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use taskforge_core::{SharedClock, SystemClock, TaskId};

use crate::checkpoint::TaskCheckpoint;
use crate::codec::{JsonCodec, StateCodec};
use crate::error::{CheckpointError, CheckpointResult};
use crate::store::{CheckpointStore, FileCheckpointStore, validate_task_id};

/// Saves and restores per-task progress so long tasks can resume after a
/// crash or restart.
///
/// Every save is durable before it returns. The cache only serves reads
/// of checkpoints that were saved or loaded through this manager.
pub struct CheckpointManager<S = FileCheckpointStore, C = JsonCodec> {
    store: S,
    codec: C,
    clock: SharedClock,
    cache: RwLock<HashMap<TaskId, TaskCheckpoint>>,
}

impl CheckpointManager {
    /// File-backed manager rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let store = FileCheckpointStore::open(dir)?;
        info!(dir = %store.dir().display(), "checkpoint store opened");
        Ok(Self::new(store))
    }

    /// File-backed manager in the default directory.
    pub fn open_default() -> CheckpointResult<Self> {
        Self::open(FileCheckpointStore::default_dir())
    }
}

impl<S: CheckpointStore> CheckpointManager<S, JsonCodec> {
    pub fn new(store: S) -> Self {
        Self::with_codec(store, JsonCodec)
    }
}

impl<S: CheckpointStore, C: StateCodec> CheckpointManager<S, C> {
    pub fn with_codec(store: S, codec: C) -> Self {
        Self {
            store,
            codec,
            clock: SystemClock::shared(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the clock used for timestamps and age checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist the latest state of `task_id`, replacing any previous one.
    pub fn save(
        &self,
        task_id: &TaskId,
        state: Vec<u8>,
        progress: u8,
        iteration: u64,
    ) -> CheckpointResult<()> {
        validate_task_id(task_id)?;
        if progress > 100 {
            return Err(CheckpointError::InvalidProgress(progress));
        }

        let checkpoint = TaskCheckpoint::new(
            task_id.clone(),
            state,
            progress,
            iteration,
            self.clock.utc_now(),
        );
        self.store.write(&checkpoint)?;
        self.cache_mut().insert(task_id.clone(), checkpoint);

        debug!(task_id = %task_id, progress, iteration, "checkpoint saved");
        Ok(())
    }

    /// Encode `state` with the manager's codec and save it.
    pub fn save_state<T: Serialize>(
        &self,
        task_id: &TaskId,
        state: &T,
        progress: u8,
        iteration: u64,
    ) -> CheckpointResult<()> {
        let bytes = self
            .codec
            .encode(state)
            .map_err(|e| CheckpointError::Encode {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?;
        self.save(task_id, bytes, progress, iteration)
    }

    /// Latest checkpoint for `task_id`, or `None` if there is none.
    pub fn load(&self, task_id: &TaskId) -> CheckpointResult<Option<TaskCheckpoint>> {
        if let Some(hit) = self.cache().get(task_id) {
            return Ok(Some(hit.clone()));
        }

        let Some(checkpoint) = self.store.read(task_id)? else {
            return Ok(None);
        };

        debug!(
            task_id = %task_id,
            progress = checkpoint.progress,
            iteration = checkpoint.iteration,
            "checkpoint loaded from store"
        );
        self.cache_mut()
            .insert(task_id.clone(), checkpoint.clone());
        Ok(Some(checkpoint))
    }

    /// Load and decode the state of `task_id`.
    ///
    /// Returns the decoded value alongside its checkpoint metadata.
    pub fn load_state<T: DeserializeOwned>(
        &self,
        task_id: &TaskId,
    ) -> CheckpointResult<Option<(T, TaskCheckpoint)>> {
        let Some(checkpoint) = self.load(task_id)? else {
            return Ok(None);
        };
        let value = self
            .codec
            .decode(&checkpoint.state)
            .map_err(|e| CheckpointError::Decode {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some((value, checkpoint)))
    }

    /// Whether a checkpoint exists in the cache or the store.
    ///
    /// Invalid task ids and store failures are returned as errors.
    pub fn try_has_checkpoint(&self, task_id: &TaskId) -> CheckpointResult<bool> {
        if self.cache().contains_key(task_id) {
            return Ok(true);
        }
        self.store.exists(task_id)
    }

    /// Boolean shorthand for [`try_has_checkpoint`](Self::try_has_checkpoint).
    ///
    /// A failed lookup is logged at `warn` and reported as absent, so a
    /// caller deciding "resume or start fresh" starts fresh. Use
    /// `try_has_checkpoint` to tell the two apart.
    pub fn has_checkpoint(&self, task_id: &TaskId) -> bool {
        self.try_has_checkpoint(task_id).unwrap_or_else(|err| {
            warn!(task_id = %task_id, error = %err, "checkpoint lookup failed");
            false
        })
    }

    /// Remove the checkpoint of `task_id`. Returns whether one existed.
    pub fn delete(&self, task_id: &TaskId) -> CheckpointResult<bool> {
        let cached = self.cache_mut().remove(task_id).is_some();
        let stored = self.store.remove(task_id)?;
        if cached || stored {
            debug!(task_id = %task_id, "checkpoint deleted");
        }
        Ok(cached || stored)
    }

    /// Delete every checkpoint older than `max_age`. Returns how many were
    /// removed.
    ///
    /// Unreadable checkpoints are logged and left alone.
    pub fn cleanup_old_checkpoints(&self, max_age: Duration) -> CheckpointResult<usize> {
        let now = self.clock.utc_now();
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut removed = 0;
        for task_id in self.store.list()? {
            let checkpoint = match self.store.read(&task_id) {
                Ok(Some(checkpoint)) => checkpoint,
                Ok(None) => continue,
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "skipping unreadable checkpoint");
                    continue;
                }
            };
            if !checkpoint.is_older_than(cutoff) {
                continue;
            }
            if self.store.remove(&task_id)? {
                removed += 1;
            }
            self.cache_mut().remove(&task_id);
        }

        if removed > 0 {
            info!(removed, "old checkpoints cleaned up");
        }
        Ok(removed)
    }

    /// Drop the in-memory cache. Durable checkpoints are untouched.
    pub fn clear_cache(&self) {
        self.cache_mut().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache().len()
    }

    /// Every task with a durable checkpoint.
    pub fn task_ids(&self) -> CheckpointResult<Vec<TaskId>> {
        self.store.list()
    }

    fn cache(&self) -> RwLockReadGuard<'_, HashMap<TaskId, TaskCheckpoint>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_mut(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, TaskCheckpoint>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S, C> std::fmt::Debug for CheckpointManager<S, C>
where
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("store", &self.store)
            .field(
                "cached",
                &self.cache.read().unwrap_or_else(|e| e.into_inner()).len(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCheckpointStore;
    use serde::Deserialize;
    use taskforge_core::ManualClock;

    fn id(raw: &str) -> TaskId {
        TaskId::new(raw)
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();

        manager.save(&id("task1"), b"S".to_vec(), 50, 3).unwrap();

        let cp = manager.load(&id("task1")).unwrap().unwrap();
        assert_eq!(cp.state, b"S");
        assert_eq!(cp.progress, 50);
        assert_eq!(cp.iteration, 3);
        assert!(manager.has_checkpoint(&id("task1")));
    }

    #[test]
    fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = CheckpointManager::open(dir.path()).unwrap();
            manager.save(&id("task1"), b"S".to_vec(), 50, 3).unwrap();
        }

        let manager = CheckpointManager::open(dir.path()).unwrap();
        assert_eq!(manager.cached_count(), 0);
        let cp = manager.load(&id("task1")).unwrap().unwrap();
        assert_eq!((cp.progress, cp.iteration), (50, 3));
        assert_eq!(manager.cached_count(), 1);
    }

    #[test]
    fn clear_cache_falls_back_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();
        manager.save(&id("task1"), b"S".to_vec(), 50, 3).unwrap();

        manager.clear_cache();

        assert_eq!(manager.cached_count(), 0);
        assert!(manager.has_checkpoint(&id("task1")));
        assert_eq!(manager.load(&id("task1")).unwrap().unwrap().state, b"S");
    }

    #[test]
    fn later_save_replaces_earlier() {
        let manager = CheckpointManager::new(InMemoryCheckpointStore::new());
        manager.save(&id("t"), b"a".to_vec(), 10, 1).unwrap();
        manager.save(&id("t"), b"b".to_vec(), 20, 2).unwrap();

        let cp = manager.load(&id("t")).unwrap().unwrap();
        assert_eq!(cp.state, b"b");
        assert_eq!(cp.iteration, 2);
    }

    #[test]
    fn delete_removes_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();
        manager.save(&id("task1"), b"S".to_vec(), 50, 3).unwrap();

        assert!(manager.delete(&id("task1")).unwrap());

        assert!(manager.load(&id("task1")).unwrap().is_none());
        assert!(!manager.has_checkpoint(&id("task1")));
        assert!(!dir.path().join("task1.checkpoint").exists());
        assert!(!manager.delete(&id("task1")).unwrap());
    }

    #[test]
    fn unknown_task_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();
        assert!(manager.load(&id("never")).unwrap().is_none());
        assert!(!manager.has_checkpoint(&id("never")));
    }

    #[test]
    fn progress_over_100_is_rejected() {
        let manager = CheckpointManager::new(InMemoryCheckpointStore::new());
        let err = manager.save(&id("t"), vec![], 101, 0).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidProgress(101)));
        assert!(!manager.has_checkpoint(&id("t")));
    }

    #[test]
    fn path_like_task_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();
        let err = manager.save(&id("../escape"), vec![], 0, 0).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidTaskId { .. }));
    }

    #[test]
    fn lookup_errors_are_reported_by_try_variant() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();

        let err = manager.try_has_checkpoint(&id("a/b")).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidTaskId { .. }));
        assert!(!manager.has_checkpoint(&id("a/b")));

        manager.save(&id("task1"), b"S".to_vec(), 1, 1).unwrap();
        assert!(manager.try_has_checkpoint(&id("task1")).unwrap());
        assert!(!manager.try_has_checkpoint(&id("task2")).unwrap());
    }

    #[test]
    fn debug_output_shows_cache_size() {
        let manager = CheckpointManager::new(InMemoryCheckpointStore::new());
        manager.save(&id("t"), vec![1], 1, 1).unwrap();

        let rendered = format!("{manager:?}");
        assert!(rendered.starts_with("CheckpointManager"), "{rendered}");
        assert!(rendered.contains("cached: 1"), "{rendered}");
    }

    #[test]
    fn cleanup_removes_only_old_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::shared();
        let manager = CheckpointManager::open(dir.path())
            .unwrap()
            .with_clock(clock.clone());

        manager.save(&id("old"), b"o".to_vec(), 10, 1).unwrap();
        clock.advance(Duration::from_secs(2 * 3600));
        manager.save(&id("fresh"), b"f".to_vec(), 10, 1).unwrap();

        let removed = manager
            .cleanup_old_checkpoints(Duration::from_secs(3600))
            .unwrap();

        assert_eq!(removed, 1);
        assert!(!manager.has_checkpoint(&id("old")));
        assert!(manager.has_checkpoint(&id("fresh")));
        assert_eq!(manager.task_ids().unwrap(), vec![id("fresh")]);
    }

    #[test]
    fn cleanup_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("broken.checkpoint"), b"garbage").unwrap();

        assert_eq!(manager.cleanup_old_checkpoints(Duration::ZERO).unwrap(), 0);
        assert!(dir.path().join("broken.checkpoint").exists());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        rows_done: u64,
        cursor: String,
    }

    #[test]
    fn structured_state_round_trip() {
        let manager = CheckpointManager::new(InMemoryCheckpointStore::new());
        let state = Progress {
            rows_done: 1200,
            cursor: "page-13".into(),
        };
        manager.save_state(&id("import"), &state, 40, 13).unwrap();

        let (back, cp) = manager.load_state::<Progress>(&id("import")).unwrap().unwrap();
        assert_eq!(back, state);
        assert_eq!(cp.progress, 40);
    }

    #[test]
    fn decode_mismatch_is_an_error() {
        let manager = CheckpointManager::new(InMemoryCheckpointStore::new());
        manager.save(&id("t"), b"\xff\x00".to_vec(), 0, 0).unwrap();

        let err = manager.load_state::<Progress>(&id("t")).unwrap_err();
        assert!(matches!(err, CheckpointError::Decode { .. }));
    }
}
