//! Connected workers and their free capacity
//!
//! The pool keeps connections in the order they were registered; that
//! order is the tie-break whenever several workers could take a task.
//! Capacity is tracked as an explicit slot count per connection and is
//! recomputed from the running set on every dispatch attempt.

use crate::registry::WorkerIdentity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// Identifier of one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound side of a worker connection
///
/// Frames are queued onto an unbounded channel drained by the
/// connection's writer task, so sending never blocks and never needs the
/// dispatch lock to be held across an await. The link reports closed once
/// the writer task has gone away.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    tx: mpsc::UnboundedSender<String>,
}

impl WorkerLink {
    /// Create a link and the receiver its writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame for delivery; false if the connection is gone
    pub fn send(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Platform metadata reported in the handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformInfo {
    pub platform: String,
    pub os: String,
    pub cpu: Value,
    pub cpu_count: usize,
}

/// A live, admitted worker connection
#[derive(Debug)]
pub struct WorkerConnection {
    pub id: ConnectionId,
    pub identity: WorkerIdentity,
    pub link: WorkerLink,

    /// Concurrent tasks this worker accepts
    pub max_tasks: usize,

    /// Remote address
    pub host: String,
    pub platform: PlatformInfo,
    pub connected_at: DateTime<Utc>,
}

/// Free capacity of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestingSlot {
    pub connection: ConnectionId,
    pub free: usize,
}

/// Introspection view of a connected worker, never carrying the token
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub connection: String,
    pub nickname: String,
    pub host: String,
    pub max_tasks: usize,
    pub running: usize,
    pub trusted: bool,
    pub platform: String,
    pub os: String,
    pub cpu_count: usize,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct WorkerPool {
    connections: Vec<WorkerConnection>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, connection: WorkerConnection) {
        self.connections.push(connection);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<WorkerConnection> {
        let pos = self.connections.iter().position(|c| c.id == id)?;
        Some(self.connections.remove(pos))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&WorkerConnection> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// Drop connections whose link has closed, returning their ids
    pub fn prune_closed(&mut self) -> Vec<ConnectionId> {
        let mut pruned = Vec::new();
        self.connections.retain(|c| {
            let open = c.link.is_open();
            if !open {
                pruned.push(c.id);
            }
            open
        });
        pruned
    }

    /// Free slots per worker, in connection order
    ///
    /// Workers with no free slot are left out. `running` maps each
    /// connection to the number of tasks it currently holds.
    pub fn resting_slots(&self, running: &HashMap<ConnectionId, usize>) -> Vec<RestingSlot> {
        self.connections
            .iter()
            .filter_map(|c| {
                let busy = running.get(&c.id).copied().unwrap_or(0);
                let free = c.max_tasks.saturating_sub(busy);
                (free > 0).then_some(RestingSlot {
                    connection: c.id,
                    free,
                })
            })
            .collect()
    }

    /// Summaries of open connections
    pub fn summaries(&self, running: &HashMap<ConnectionId, usize>) -> Vec<WorkerSummary> {
        self.connections
            .iter()
            .filter(|c| c.link.is_open())
            .map(|c| WorkerSummary {
                connection: c.id.to_string(),
                nickname: c.identity.nickname.clone(),
                host: c.host.clone(),
                max_tasks: c.max_tasks,
                running: running.get(&c.id).copied().unwrap_or(0),
                trusted: c.identity.trusted,
                platform: c.platform.platform.clone(),
                os: c.platform.os.clone(),
                cpu_count: c.platform.cpu_count,
                connected_at: c.connected_at,
            })
            .collect()
    }

    /// Links of every connection, for keep-alives
    pub fn links(&self) -> impl Iterator<Item = &WorkerLink> {
        self.connections.iter().map(|c| &c.link)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
