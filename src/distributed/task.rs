//! Tasks and their identifiers

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Task type tag used for audio analysis requests
pub const AUDIO_TASK: &str = "audio";

/// Unique task identifier
///
/// Allocated from a monotonic counter, so ids are never reused during the
/// coordinator's lifetime and compare in submission order. On the wire an
/// id is its decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Opaque work description shipped to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Task type tag, interpreted by the worker's compute handler
    pub task: String,

    /// Task parameters
    pub params: Value,
}

impl TaskPayload {
    pub fn new(task: impl Into<String>, params: Value) -> Self {
        Self {
            task: task.into(),
            params,
        }
    }

    /// Payload carrying a raw file, base64-encoded under `params.file`
    pub fn file(task: impl Into<String>, filename: &str, bytes: &[u8]) -> Self {
        Self::new(
            task,
            json!({
                "filename": filename,
                "file": BASE64.encode(bytes),
            }),
        )
    }
}

/// A submitted unit of work
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: TaskPayload,
    pub created: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, payload: TaskPayload) -> Self {
        Self {
            id,
            payload,
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_wire_form() {
        let id = TaskId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<TaskId>().unwrap(), id);
        assert!("t-42".parse::<TaskId>().is_err());
        assert!(TaskId::new(1) < TaskId::new(2));
    }

    #[test]
    fn test_file_payload() {
        let payload = TaskPayload::file(AUDIO_TASK, "clip.wav", b"RIFF");
        assert_eq!(payload.task, "audio");
        assert_eq!(payload.params["filename"], "clip.wav");
        assert_eq!(payload.params["file"], "UklGRg==");
    }
}
