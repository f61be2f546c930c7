//! Durable per-task checkpoints.
//!
//! A task periodically calls [`CheckpointManager::save`] with its opaque
//! state, a progress percentage and an iteration number. After a crash the
//! task calls [`CheckpointManager::load`] and resumes from the latest
//! checkpoint instead of starting over.

pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod manager;
pub mod store;

pub use checkpoint::TaskCheckpoint;
pub use codec::{CodecError, JsonCodec, StateCodec};
pub use error::{CheckpointError, CheckpointResult};
pub use manager::CheckpointManager;
pub use store::{
    CHECKPOINT_EXTENSION, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
    validate_task_id,
};
