//! Result correlation
//!
//! Each worker connection owns one receive loop for its lifetime. Inbound
//! frames are matched to running tasks by id; anything that does not match
//! (keep-alives, malformed records, stale or duplicate ids) is dropped
//! without ending the loop.

use super::coordinator::Coordinator;
use super::dispatcher::DispatchState;
use super::pool::ConnectionId;
use super::protocol::{parse_worker_frame, read_frame_bytes, WorkerFrame};
use super::task::TaskId;
use tokio::io::AsyncRead;

/// What a single inbound frame amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    KeepAlive,

    /// A running task was resolved; capacity was freed
    Completed(TaskId),

    /// Not a keep-alive and not a result record
    Malformed,

    /// A result for an id that is not running on this connection
    UnknownTask(String),
}

/// Match one inbound frame against the running set
pub fn correlate(state: &mut DispatchState, connection: ConnectionId, text: &str) -> FrameOutcome {
    let msg = match parse_worker_frame(text) {
        Ok(WorkerFrame::KeepAlive) => return FrameOutcome::KeepAlive,
        Ok(WorkerFrame::Result(msg)) => msg,
        Err(e) => {
            tracing::warn!(%connection, "Ignoring malformed message: {:#}", e);
            return FrameOutcome::Malformed;
        }
    };

    let Ok(id) = msg.id.parse::<TaskId>() else {
        tracing::warn!(%connection, id = %msg.id, "Ignoring result with unrecognized task id");
        return FrameOutcome::UnknownTask(msg.id);
    };

    if state.complete(connection, id, msg.result) {
        tracing::debug!(%connection, task = %id, "Task completed");
        FrameOutcome::Completed(id)
    } else {
        tracing::warn!(%connection, task = %id, "Ignoring result for task not running here");
        FrameOutcome::UnknownTask(msg.id)
    }
}

/// Receive frames from one worker until its connection closes
pub async fn receive_loop<R>(coordinator: &Coordinator, connection: ConnectionId, reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    loop {
        let body = match read_frame_bytes(reader).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!(%connection, "Worker closed connection");
                break;
            }
            Err(e) => {
                tracing::info!(%connection, "Worker connection ended: {:#}", e);
                break;
            }
        };

        match String::from_utf8(body) {
            Ok(text) => {
                coordinator.handle_frame(connection, &text);
            }
            Err(_) => tracing::warn!(%connection, "Ignoring frame that is not valid UTF-8"),
        }
    }
}
