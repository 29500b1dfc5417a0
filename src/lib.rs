//! voicepool - Capacity-aware task coordinator
//!
//! voicepool runs the coordinator of a speech analysis compute farm. Remote
//! worker processes hold long-lived connections to the coordinator, which
//! queues compute requests and ships them to whichever worker has a free
//! slot, then routes each result back to the caller waiting on it.
//!
//! # Architecture
//!
//! - **Registry**: persisted worker identities behind an injectable store
//! - **Gateway**: one-shot handshake and capacity negotiation per connection
//! - **Dispatcher**: strict FIFO matching of queued tasks to resting workers
//! - **Correlator**: per-connection receive loop resolving completion handles
//! - **Node service**: the worker side of the protocol
//! - **HTTP**: thin submission and introspection surface

pub mod config;
pub mod distributed;
pub mod http;
pub mod registry;

// Re-export commonly used types
pub use config::Config;
pub use distributed::{CompletionHandle, Coordinator, TaskError, TaskPayload};
pub use registry::{WorkerIdentity, WorkerRegistry};

/// Result type used throughout voicepool
pub type Result<T> = anyhow::Result<T>;
