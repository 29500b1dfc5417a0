//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::registry::{JsonFileIdentityStore, WorkerRegistry};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Complete voicepool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub worker: WorkerNodeConfig,
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address workers connect to
    pub listen: String,

    /// Address of the HTTP submission surface
    pub http_listen: String,

    /// Upper bound on concurrent tasks per worker, whatever it advertises
    pub hard_cap: usize,

    /// Time a new connection has to send its handshake
    pub handshake_timeout_secs: u64,

    /// Interval between keep-alive frames
    pub keepalive_interval_secs: u64,

    /// How long an HTTP submission waits for its result
    pub submit_timeout_secs: u64,

    /// What happens to running tasks when their worker disconnects
    pub orphan_policy: OrphanPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7800".to_string(),
            http_listen: "0.0.0.0:7801".to_string(),
            hard_cap: 8,
            handshake_timeout_secs: 10,
            keepalive_interval_secs: 1,
            submit_timeout_secs: 600,
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }
}

/// Fate of tasks running on a worker that disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Keep the tasks as running; their handles never resolve
    Leave,
    /// Resolve the handles with a worker-lost error
    #[default]
    Fail,
    /// Put the tasks back in the queue at their original position
    Requeue,
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrphanPolicy::Leave => write!(f, "leave"),
            OrphanPolicy::Fail => write!(f, "fail"),
            OrphanPolicy::Requeue => write!(f, "requeue"),
        }
    }
}

/// Worker registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file holding worker identities (in-memory when unset)
    pub path: Option<PathBuf>,

    /// Whether identities created on first contact are approved
    pub auto_approve: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            auto_approve: true,
        }
    }
}

impl RegistryConfig {
    /// Open the registry this configuration describes
    pub fn open(&self) -> Result<WorkerRegistry> {
        match &self.path {
            Some(path) => {
                let store = JsonFileIdentityStore::open(path)?;
                tracing::debug!(path = %store.path().display(), "Opened worker registry");
                Ok(WorkerRegistry::new(Arc::new(store), self.auto_approve))
            }
            None => Ok(WorkerRegistry::in_memory(self.auto_approve)),
        }
    }
}

/// Worker node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerNodeConfig {
    /// Coordinator address to connect to
    pub coordinator: String,

    /// File holding this worker's token (generated if missing)
    pub token_path: PathBuf,

    /// Pause between reconnection attempts
    pub reconnect_delay_secs: u64,

    /// Advertised CPU count (detected when unset)
    pub cpu_count: Option<usize>,
}

impl Default for WorkerNodeConfig {
    fn default() -> Self {
        Self {
            coordinator: "127.0.0.1:7800".to_string(),
            token_path: PathBuf::from("config/token.txt"),
            reconnect_delay_secs: 1,
            cpu_count: None,
        }
    }
}

impl WorkerNodeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}
