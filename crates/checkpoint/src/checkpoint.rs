//! The checkpoint record.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use taskforge_core::TaskId;

/// Latest persisted progress of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub task_id: TaskId,
    /// Opaque task state, base64 on disk
    #[serde(serialize_with = "encode_b64", deserialize_with = "decode_b64")]
    pub state: Vec<u8>,
    /// Percentage complete (0-100), meaning defined by the task
    pub progress: u8,
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
}

impl TaskCheckpoint {
    pub fn new(
        task_id: TaskId,
        state: Vec<u8>,
        progress: u8,
        iteration: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            state,
            progress,
            iteration,
            timestamp,
        }
    }

    /// Whether this checkpoint was taken before `cutoff`.
    pub fn is_older_than(&self, cutoff: DateTime<Utc>) -> bool {
        self.timestamp < cutoff
    }
}

fn encode_b64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn decode_b64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_base64_in_json() {
        let cp = TaskCheckpoint::new(TaskId::new("t1"), vec![0, 1, 2, 255], 10, 1, Utc::now());
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["state"], "AAEC/w==");

        let back: TaskCheckpoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let json = serde_json::json!({
            "task_id": "t1",
            "state": "not base64!!",
            "progress": 1,
            "iteration": 1,
            "timestamp": "2024-01-01T00:00:00Z"
        });
        assert!(serde_json::from_value::<TaskCheckpoint>(json).is_err());
    }
}
