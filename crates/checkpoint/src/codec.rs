//! Pluggable encoding for structured task state.
//!
//! The checkpoint layer itself only stores bytes. A codec is used by
//! [`CheckpointManager::save_state`](crate::CheckpointManager::save_state)
//! and [`load_state`](crate::CheckpointManager::load_state).

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Boxed codec failure.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Bytes-in/bytes-out serializer for task state.
pub trait StateCodec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec (default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl StateCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
