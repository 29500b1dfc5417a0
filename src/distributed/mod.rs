//! Distributed task execution
//!
//! # Architecture
//!
//! voicepool uses a coordinator-worker architecture:
//!
//! - **Coordinator**: accepts worker connections, queues tasks, dispatches
//!   them to free slots and routes results back to callers
//! - **Node Service**: runs on worker machines, executes tasks and reports
//!   results over the same connection
//!
//! # Modules
//!
//! - `protocol`: frame codec and message definitions
//! - `gateway`: handshake validation and capacity negotiation
//! - `pool`, `queue`, `dispatcher`: dispatch state and the matching loop
//! - `correlator`: result correlation per connection
//! - `handle`: completion handles returned to submitters
//! - `coordinator`: the coordinator facade and network loops
//! - `node_service`: the worker side

pub mod coordinator;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod handle;
pub mod node_service;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod task;

// Re-export key types
pub use coordinator::Coordinator;
pub use dispatcher::{PoolStats, TaskState};
pub use error::{HandshakeError, TaskError};
pub use handle::{CompletionHandle, TaskOutcome};
pub use node_service::{ComputeHandler, EchoHandler, NodeService};
pub use pool::{ConnectionId, WorkerSummary};
pub use protocol::PROTOCOL_VERSION;
pub use task::{TaskId, TaskPayload, AUDIO_TASK};
