//! Dispatch state and the matching loop
//!
//! Everything the dispatcher reads or mutates (the worker pool, the FIFO
//! queue, the running set and the pending completion handles) lives in one
//! [`DispatchState`]. The coordinator keeps it behind a single mutex, so a
//! dispatch pass triggered by a submission can never interleave with one
//! triggered by a result or a new worker, and a slot is never handed out
//! twice.
//!
//! Task lifecycle:
//!
//! ```text
//! submit ──> Queued ──dispatch──> Running ──result──> Completed
//!              │  ^                  │
//!              │  └──── requeue ─────┤  (worker lost, requeue policy)
//!              └──────── cancel ─────┴──> Cancelled / Failed
//! ```

use super::error::TaskError;
use super::handle::{completion_pair, CompletionHandle, Completer};
use super::pool::{ConnectionId, RestingSlot, WorkerConnection, WorkerPool, WorkerSummary};
use super::protocol::CoordinatorMessage;
use super::task::{Task, TaskId, TaskPayload};
use super::queue::TaskQueue;
use crate::config::OrphanPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// A task currently held by a worker
#[derive(Debug)]
pub struct RunningTask {
    pub task: Task,
    pub connection: ConnectionId,
    pub dispatched_at: DateTime<Utc>,
}

/// One assignment made by a dispatch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub task: TaskId,
    pub connection: ConnectionId,
}

/// What happened to a disconnected worker's running tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Orphans {
    pub failed: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
    pub left: Vec<TaskId>,
}

impl Orphans {
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.requeued.is_empty() && self.left.is_empty()
    }
}

/// Where a task currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running(ConnectionId),
    /// Completed, failed, cancelled, or never submitted
    Unknown,
}

/// Counters for introspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub total_slots: usize,
    pub queued: usize,
    pub running: usize,
    pub submitted: u64,
    pub completed: u64,

    /// Submission time of the task waiting longest
    pub oldest_queued_at: Option<DateTime<Utc>>,

    /// Dispatch time of the task running longest
    pub oldest_running_since: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DispatchState {
    pool: WorkerPool,
    queue: TaskQueue,
    running: HashMap<TaskId, RunningTask>,
    pending: HashMap<TaskId, Completer>,
    orphan_policy: OrphanPolicy,
    next_task_id: u64,
    next_connection_id: u64,
    completed: u64,
}

impl DispatchState {
    pub fn new(orphan_policy: OrphanPolicy) -> Self {
        Self {
            pool: WorkerPool::new(),
            queue: TaskQueue::new(),
            running: HashMap::new(),
            pending: HashMap::new(),
            orphan_policy,
            next_task_id: 1,
            next_connection_id: 1,
            completed: 0,
        }
    }

    /// Allocate an id, enqueue the task and hand back its completion handle
    ///
    /// Does not dispatch; the caller runs [`DispatchState::dispatch`] after.
    pub fn submit(&mut self, payload: TaskPayload) -> CompletionHandle {
        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;

        let (completer, handle) = completion_pair(id);
        self.pending.insert(completer.id(), completer);
        self.queue.push(Task::new(id, payload));

        handle
    }

    /// Allocate a connection id for a worker about to be registered
    pub fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_connection_id);
        self.next_connection_id += 1;
        id
    }

    /// Add an admitted worker to the end of the pool
    pub fn register(&mut self, connection: WorkerConnection) {
        self.pool.add(connection);
    }

    /// Number of running tasks per connection
    pub fn running_counts(&self) -> HashMap<ConnectionId, usize> {
        let mut counts = HashMap::new();
        for record in self.running.values() {
            *counts.entry(record.connection).or_insert(0) += 1;
        }
        counts
    }

    /// Prune closed connections, then enumerate free capacity
    ///
    /// Pruned connections get the orphan policy applied to their tasks.
    pub fn resting_slots(&mut self) -> Vec<RestingSlot> {
        for connection in self.pool.prune_closed() {
            tracing::info!(%connection, "Pruned closed worker connection");
            self.release_orphans(connection);
        }
        self.pool.resting_slots(&self.running_counts())
    }

    /// Pair free capacity with queued tasks until one of them runs out
    ///
    /// Tasks leave the queue strictly oldest first; slots are taken in
    /// connection order. A send that fails because the connection closed
    /// puts the task back at its position and drops the connection.
    pub fn dispatch(&mut self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();

        'pass: while !self.queue.is_empty() {
            let slots = self.resting_slots();
            if slots.is_empty() {
                break;
            }

            for slot in slots {
                for _ in 0..slot.free {
                    let Some(task) = self.queue.pop() else {
                        break 'pass;
                    };

                    let sent = self
                        .pool
                        .get(slot.connection)
                        .map(|c| c.link.send(compute_frame(&task)))
                        .unwrap_or(false);

                    if !sent {
                        tracing::warn!(task = %task.id, connection = %slot.connection,
                            "Dispatch failed, worker connection closed");
                        self.queue.requeue(task);
                        self.disconnect(slot.connection);
                        continue 'pass;
                    }

                    let now = Utc::now();
                    tracing::debug!(task = %task.id, connection = %slot.connection,
                        queued_ms = (now - task.created).num_milliseconds(), "Dispatched task");
                    dispatched.push(Dispatch {
                        task: task.id,
                        connection: slot.connection,
                    });
                    self.running.insert(
                        task.id,
                        RunningTask {
                            task,
                            connection: slot.connection,
                            dispatched_at: now,
                        },
                    );
                }
            }
        }

        dispatched
    }

    /// Resolve a running task with the result its worker reported
    ///
    /// Only the connection the task was dispatched to may complete it. Any
    /// other id (unknown, already completed, or running elsewhere) is left
    /// untouched and `false` is returned.
    pub fn complete(&mut self, connection: ConnectionId, id: TaskId, result: serde_json::Value) -> bool {
        match self.running.get(&id) {
            Some(record) if record.connection == connection => {}
            _ => return false,
        }

        if let Some(record) = self.running.remove(&id) {
            tracing::debug!(task = %id, %connection,
                run_ms = (Utc::now() - record.dispatched_at).num_milliseconds(), "Task completed");
        }
        self.completed += 1;
        if let Some(completer) = self.pending.remove(&id) {
            if !completer.resolve(Ok(result)) {
                tracing::debug!(task = %id, "Caller stopped waiting before result arrived");
            }
        }
        true
    }

    /// Forget a connection and apply the orphan policy to its tasks
    pub fn disconnect(&mut self, connection: ConnectionId) -> Orphans {
        if self.pool.remove(connection).is_some() {
            tracing::info!(%connection, "Worker disconnected");
        }
        self.release_orphans(connection)
    }

    fn release_orphans(&mut self, connection: ConnectionId) -> Orphans {
        let mut ids: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, record)| record.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        let mut orphans = Orphans::default();
        if ids.is_empty() {
            return orphans;
        }

        match self.orphan_policy {
            OrphanPolicy::Leave => {
                tracing::warn!(%connection, count = ids.len(), "Running tasks orphaned by disconnect");
                orphans.left = ids;
            }
            OrphanPolicy::Fail => {
                for id in ids {
                    self.running.remove(&id);
                    if let Some(completer) = self.pending.remove(&id) {
                        completer.resolve(Err(TaskError::WorkerLost {
                            task_id: id.to_string(),
                            worker: connection.to_string(),
                        }));
                    }
                    orphans.failed.push(id);
                }
                tracing::warn!(%connection, count = orphans.failed.len(), "Failed tasks of lost worker");
            }
            OrphanPolicy::Requeue => {
                for id in ids {
                    if let Some(record) = self.running.remove(&id) {
                        self.queue.requeue(record.task);
                        orphans.requeued.push(id);
                    }
                }
                tracing::info!(%connection, count = orphans.requeued.len(), "Requeued tasks of lost worker");
            }
        }

        orphans
    }

    /// Cancel a queued or running task
    ///
    /// A queued task is removed from the queue; a running task is dropped
    /// from the running set and its worker is sent an abort, without
    /// relying on delivery. Returns false if the task is not pending.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if self.queue.remove(id).is_none() {
            let Some(record) = self.running.remove(&id) else {
                return false;
            };
            if let Some(connection) = self.pool.get(record.connection) {
                let abort = CoordinatorMessage::Abort { id: id.to_string() };
                if !connection.link.send(abort.to_text()) {
                    tracing::debug!(task = %id, "Abort not delivered, worker already gone");
                }
            }
        }

        if let Some(completer) = self.pending.remove(&id) {
            completer.resolve(Err(TaskError::Cancelled(id.to_string())));
        }
        tracing::info!(task = %id, "Cancelled task");
        true
    }

    pub fn task_state(&self, id: TaskId) -> TaskState {
        if self.queue.contains(id) {
            TaskState::Queued
        } else if let Some(record) = self.running.get(&id) {
            TaskState::Running(record.connection)
        } else {
            TaskState::Unknown
        }
    }

    /// Queued task ids, oldest first
    pub fn queued_ids(&self) -> Vec<TaskId> {
        self.queue.ids()
    }

    /// Running task ids on one connection, ascending
    pub fn running_on(&self, connection: ConnectionId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .running
            .iter()
            .filter(|(_, record)| record.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.pool.summaries(&self.running_counts())
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self.pool.summaries(&HashMap::new());
        PoolStats {
            workers: workers.len(),
            total_slots: workers.iter().map(|w| w.max_tasks).sum(),
            queued: self.queue.len(),
            running: self.running.len(),
            submitted: self.next_task_id - 1,
            completed: self.completed,
            oldest_queued_at: self.queue.oldest().map(|task| task.created),
            oldest_running_since: self.running.values().map(|record| record.dispatched_at).min(),
        }
    }

    /// Send a keep-alive frame to every connection
    pub fn keepalive(&self) {
        for link in self.pool.links() {
            link.send(super::protocol::KEEPALIVE.to_string());
        }
    }
}

fn compute_frame(task: &Task) -> String {
    CoordinatorMessage::Compute {
        id: task.id.to_string(),
        task: task.payload.task.clone(),
        params: task.payload.params.clone(),
    }
    .to_text()
}
