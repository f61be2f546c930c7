//! Checkpoint error model.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Checkpoint failure.
///
/// A missing checkpoint is not an error; loads return `Ok(None)`.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The task id cannot be used as a checkpoint file name.
    #[error("invalid task id '{task_id}': {reason}")]
    InvalidTaskId { task_id: String, reason: &'static str },

    /// Progress must be a percentage.
    #[error("progress {0} is out of range 0..=100")]
    InvalidProgress(u8),

    /// Structured state could not be turned into bytes.
    #[error("failed to encode state for task {task_id}: {reason}")]
    Encode { task_id: String, reason: String },

    /// Stored bytes could not be turned back into the requested type.
    #[error("failed to decode state for task {task_id}: {reason}")]
    Decode { task_id: String, reason: String },

    /// A checkpoint file exists but cannot be parsed.
    #[error("checkpoint file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing the durable store failed.
    #[error("checkpoint I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
