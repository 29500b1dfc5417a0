//! Error types for the coordinator

use thiserror::Error;

/// Reasons a worker is turned away during the handshake
///
/// The `Display` text is what the worker receives after `"Error: "`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Please upgrade to the latest version {expected} (You're on {received})")]
    VersionMismatch { expected: u32, received: u32 },

    #[error("Token format mismatch")]
    TokenFormatError,

    #[error("Token not approved")]
    NotApproved,

    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection lost during handshake: {0}")]
    ConnectionLost(String),

    /// Details stay in the coordinator log; workers only learn the lookup failed
    #[error("Registry unavailable")]
    RegistryUnavailable,
}

/// Ways a completion handle can resolve without a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The worker running the task disconnected before reporting back
    #[error("worker {worker} disconnected before returning task {task_id}")]
    WorkerLost { task_id: String, worker: String },

    #[error("task {0} was cancelled")]
    Cancelled(String),

    /// The caller stopped waiting; the task itself keeps running
    #[error("timed out waiting for task {0}")]
    Timeout(String),

    /// The coordinator went away while the task was pending
    #[error("coordinator shut down before task {0} completed")]
    Dropped(String),
}
