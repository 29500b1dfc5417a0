//! FIFO task queue
//!
//! Arrival order is the only priority signal. Because task ids are
//! allocated in submission order, the queue is always sorted by id; tasks
//! handed back (failed sends, requeued orphans) are reinserted at their
//! original position rather than at the tail.

use super::task::{Task, TaskId};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly submitted task
    pub fn push(&mut self, task: Task) {
        debug_assert!(self.tasks.back().map_or(true, |last| last.id < task.id));
        self.tasks.push_back(task);
    }

    /// Take the oldest task
    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Put a previously dequeued task back in submission order
    pub fn requeue(&mut self, task: Task) {
        let pos = self.tasks.partition_point(|queued| queued.id < task.id);
        self.tasks.insert(pos, task);
    }

    /// Remove a task without disturbing the order of the rest
    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.tasks.iter().position(|task| task.id == id)?;
        self.tasks.remove(pos)
    }

    /// The task that has waited longest
    pub fn oldest(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|task| task.id == id)
    }

    /// Queued ids, oldest first
    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|task| task.id).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
