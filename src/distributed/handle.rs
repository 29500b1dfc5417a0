//! Completion handles
//!
//! A completion handle is the caller's side of a one-shot channel keyed by
//! task id. The dispatcher keeps the matching [`Completer`] until the task
//! finishes; nothing here knows about connections or transports.

use super::error::TaskError;
use super::task::TaskId;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// How a task finished
pub type TaskOutcome = Result<Value, TaskError>;

/// Create a linked completer/handle pair for a task
pub(crate) fn completion_pair(id: TaskId) -> (Completer, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    (Completer { id, tx }, CompletionHandle { id, rx })
}

/// Resolving side, held by the dispatcher
#[derive(Debug)]
pub(crate) struct Completer {
    id: TaskId,
    tx: oneshot::Sender<TaskOutcome>,
}

impl Completer {
    /// Resolve the handle; consuming `self` makes this happen at most once
    ///
    /// Returns false when the caller already dropped its handle.
    pub(crate) fn resolve(self, outcome: TaskOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }
}

/// Caller-facing handle, resolved exactly once with the task's outcome
#[derive(Debug)]
pub struct CompletionHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl CompletionHandle {
    /// Id of the task this handle tracks
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to finish
    pub async fn wait(self) -> TaskOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::Dropped(self.id.to_string())),
        }
    }

    /// Wait at most `timeout` for the task to finish
    ///
    /// A timeout leaves the task queued or running; cancel it through the
    /// coordinator if the result is no longer wanted.
    pub async fn wait_timeout(self, timeout: Duration) -> TaskOutcome {
        let id = self.id;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::Timeout(id.to_string())),
        }
    }

    /// Outcome if the task already finished, without waiting
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TaskError::Dropped(self.id.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolves_once() {
        let (completer, handle) = completion_pair(TaskId::new(1));
        assert_eq!(completer.id(), handle.id());
        assert!(completer.resolve(Ok(json!({"pitch": 180}))));
        assert_eq!(handle.wait().await, Ok(json!({"pitch": 180})));
    }

    #[tokio::test]
    async fn test_dropped_completer() {
        let (completer, handle) = completion_pair(TaskId::new(2));
        drop(completer);
        assert_eq!(handle.wait().await, Err(TaskError::Dropped("2".to_string())));
    }

    #[tokio::test]
    async fn test_timeout_and_pending() {
        let (_completer, mut handle) = completion_pair(TaskId::new(3));
        assert!(handle.try_outcome().is_none());
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(10)).await,
            Err(TaskError::Timeout("3".to_string()))
        );
    }

    #[test]
    fn test_resolve_after_caller_gave_up() {
        let (completer, handle) = completion_pair(TaskId::new(4));
        drop(handle);
        assert!(!completer.resolve(Ok(Value::Null)));
    }
}
