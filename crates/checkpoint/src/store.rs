//! Durable checkpoint storage.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use taskforge_core::TaskId;

use crate::checkpoint::TaskCheckpoint;
use crate::error::{CheckpointError, CheckpointResult};

/// File extension of durable checkpoints.
pub const CHECKPOINT_EXTENSION: &str = "checkpoint";

const FORMAT_VERSION: u32 = 1;

/// Durable checkpoint storage abstraction, one record per task id.
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint`, replacing any previous one for the task.
    ///
    /// Must be durable when it returns `Ok`.
    fn write(&self, checkpoint: &TaskCheckpoint) -> CheckpointResult<()>;

    fn read(&self, task_id: &TaskId) -> CheckpointResult<Option<TaskCheckpoint>>;

    /// Returns whether something was removed.
    fn remove(&self, task_id: &TaskId) -> CheckpointResult<bool>;

    fn exists(&self, task_id: &TaskId) -> CheckpointResult<bool>;

    /// Every task id with a stored checkpoint.
    fn list(&self) -> CheckpointResult<Vec<TaskId>>;
}

/// Reject ids that are unsafe as a file name.
pub fn validate_task_id(task_id: &TaskId) -> CheckpointResult<()> {
    let raw = task_id.as_str();
    let reason = if raw.is_empty() {
        Some("empty")
    } else if raw == "." || raw == ".." {
        Some("reserved name")
    } else if raw.starts_with('.') {
        Some("must not start with '.'")
    } else if raw.contains(['/', '\\', '\0']) {
        Some("contains a path separator or NUL")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CheckpointError::InvalidTaskId {
            task_id: raw.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// On-disk envelope.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCheckpoint {
    format_version: u32,
    #[serde(flatten)]
    checkpoint: TaskCheckpoint,
}

/// One `<task_id>.checkpoint` JSON file per task.
///
/// Writes go to a unique temp file in the same directory which is fsynced
/// and then renamed over the target, so a crash leaves either the old or the
/// new checkpoint, never a torn one.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// `<system temp dir>/taskforge-checkpoints`
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("taskforge-checkpoints")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", task_id.as_str(), CHECKPOINT_EXTENSION))
    }

    fn sync_dir(&self) {
        // Persists the rename; not supported everywhere.
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn write(&self, checkpoint: &TaskCheckpoint) -> CheckpointResult<()> {
        validate_task_id(&checkpoint.task_id)?;
        let path = self.path_for(&checkpoint.task_id);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            checkpoint.task_id.as_str(),
            Uuid::now_v7()
        ));

        let envelope = StoredCheckpoint {
            format_version: FORMAT_VERSION,
            checkpoint: checkpoint.clone(),
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| CheckpointError::Encode {
            task_id: checkpoint.task_id.to_string(),
            reason: e.to_string(),
        })?;

        let result = (|| -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(CheckpointError::io(&path, err));
        }

        self.sync_dir();
        Ok(())
    }

    fn read(&self, task_id: &TaskId) -> CheckpointResult<Option<TaskCheckpoint>> {
        validate_task_id(task_id)?;
        let path = self.path_for(task_id);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CheckpointError::io(&path, err)),
        };

        let stored: StoredCheckpoint = serde_json::from_slice(&bytes)
            .map_err(|source| CheckpointError::Corrupt {
                path: path.clone(),
                source,
            })?;

        if stored.format_version != FORMAT_VERSION {
            warn!(
                task_id = %task_id,
                version = stored.format_version,
                "checkpoint written by a different format version"
            );
        }
        Ok(Some(stored.checkpoint))
    }

    fn remove(&self, task_id: &TaskId) -> CheckpointResult<bool> {
        validate_task_id(task_id)?;
        let path = self.path_for(task_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.sync_dir();
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(CheckpointError::io(&path, err)),
        }
    }

    fn exists(&self, task_id: &TaskId) -> CheckpointResult<bool> {
        validate_task_id(task_id)?;
        let path = self.path_for(task_id);
        path.try_exists().map_err(|e| CheckpointError::io(&path, e))
    }

    fn list(&self) -> CheckpointResult<Vec<TaskId>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;
        let suffix = format!(".{CHECKPOINT_EXTENSION}");

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(&suffix) {
                ids.push(TaskId::new(id));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-memory store for tests/dev. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<TaskId, TaskCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn write(&self, checkpoint: &TaskCheckpoint) -> CheckpointResult<()> {
        validate_task_id(&checkpoint.task_id)?;
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(checkpoint.task_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn read(&self, task_id: &TaskId) -> CheckpointResult<Option<TaskCheckpoint>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned())
    }

    fn remove(&self, task_id: &TaskId) -> CheckpointResult<bool> {
        Ok(self
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
            .is_some())
    }

    fn exists(&self, task_id: &TaskId) -> CheckpointResult<bool> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id))
    }

    fn list(&self) -> CheckpointResult<Vec<TaskId>> {
        let mut ids: Vec<_> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn checkpoint(id: &str, progress: u8) -> TaskCheckpoint {
        TaskCheckpoint::new(TaskId::new(id), b"state".to_vec(), progress, 1, Utc::now())
    }

    #[test]
    fn write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();

        store.write(&checkpoint("job-1", 40)).unwrap();

        assert!(dir.path().join("job-1.checkpoint").exists());
        let back = store.read(&TaskId::new("job-1")).unwrap().unwrap();
        assert_eq!(back.progress, 40);
        assert_eq!(back.state, b"state");
    }

    #[test]
    fn overwrite_keeps_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();

        store.write(&checkpoint("job-1", 10)).unwrap();
        store.write(&checkpoint("job-1", 90)).unwrap();

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(store.read(&TaskId::new("job-1")).unwrap().unwrap().progress, 90);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        assert!(store.read(&TaskId::new("nope")).unwrap().is_none());
        assert!(!store.remove(&TaskId::new("nope")).unwrap());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("bad.checkpoint"), b"{not json").unwrap();

        let err = store.read(&TaskId::new("bad")).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn list_ignores_temp_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        store.write(&checkpoint("b", 1)).unwrap();
        store.write(&checkpoint("a", 1)).unwrap();
        fs::write(dir.path().join(".a.123.tmp"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        assert_eq!(store.list().unwrap(), vec![TaskId::new("a"), TaskId::new("b")]);
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        for bad in ["", ".", "..", "../escape", "a/b", "a\\b", ".hidden"] {
            assert!(
                validate_task_id(&TaskId::new(bad)).is_err(),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_task_id(&TaskId::new("task-2024_01.v2")).is_ok());
    }
}
