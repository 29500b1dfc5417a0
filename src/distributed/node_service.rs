//! Node service for worker machines
//!
//! This module implements the service that runs on each worker machine.
//! The node service:
//! - Loads (or generates) its long-lived token
//! - Connects to the coordinator and performs the handshake
//! - Runs dispatched tasks through a [`ComputeHandler`], several at a time
//! - Reports each result tagged with the task id
//! - Reconnects when the connection drops (a rejection is final)

use crate::config::WorkerNodeConfig;
use crate::distributed::protocol::*;
use crate::registry::{generate_token, is_valid_token};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::sleep;

/// Executes dispatched tasks
///
/// Implementations are called on the blocking thread pool and may take as
/// long as the analysis needs. Whatever value is returned is forwarded to
/// the waiting caller verbatim, including error descriptions.
///
/// An abort from the coordinator only discards the result: a computation
/// already running cannot be interrupted and runs to completion. It keeps
/// its CPU slot until then, so a node never runs more computations at once
/// than the CPU count it advertised.
pub trait ComputeHandler: Send + Sync + 'static {
    fn compute(&self, task: &str, params: &Value) -> Value;
}

/// Handler that describes its input instead of analysing it
///
/// Useful for exercising a deployment end to end without the analysis
/// stack installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl ComputeHandler for EchoHandler {
    fn compute(&self, task: &str, params: &Value) -> Value {
        let bytes = params
            .get("file")
            .and_then(Value::as_str)
            .map(|encoded| BASE64.decode(encoded).map(|raw| raw.len()));

        match bytes {
            Some(Err(e)) => json!({ "error": format!("file is not valid base64: {e}") }),
            Some(Ok(len)) => json!({
                "task": task,
                "filename": params.get("filename").cloned().unwrap_or(Value::Null),
                "bytes": len,
            }),
            None => json!({ "task": task, "params": params }),
        }
    }
}

/// Reason a session with the coordinator ended
#[derive(Debug)]
pub enum SessionEnd {
    /// The coordinator refused the handshake; retrying will not help
    Rejected(String),

    /// The connection dropped after it was established
    Disconnected,
}

/// Worker node service
pub struct NodeService {
    config: WorkerNodeConfig,
    token: String,
    handler: Arc<dyn ComputeHandler>,

    /// One permit per advertised CPU, held for the life of a computation
    compute_slots: Arc<Semaphore>,
}

impl NodeService {
    /// Create a node service, loading or generating its token
    pub fn new(config: WorkerNodeConfig, handler: Arc<dyn ComputeHandler>) -> Result<Self> {
        let token = load_token(&config.token_path)?;
        Ok(Self::with_token(config, token, handler))
    }

    /// Create a node service with an explicit token
    pub fn with_token(config: WorkerNodeConfig, token: String, handler: Arc<dyn ComputeHandler>) -> Self {
        let cpus = config.cpu_count.unwrap_or_else(num_cpus::get).max(1);
        Self {
            config,
            token,
            handler,
            compute_slots: Arc::new(Semaphore::new(cpus)),
        }
    }

    /// Handshake record describing this machine
    pub fn handshake(&self) -> Handshake {
        let cpu_count = self.config.cpu_count.unwrap_or_else(num_cpus::get);
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Handshake {
            token: self.token.clone(),
            version: PROTOCOL_VERSION,
            cpu_count,
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            os: std::env::consts::OS.to_string(),
            cpu: json!({
                "arch": std::env::consts::ARCH,
                "logical_cores": num_cpus::get(),
                "physical_cores": num_cpus::get_physical(),
                "hostname": host,
            }),
        }
    }

    /// Run the node service
    ///
    /// Connects to the coordinator, serves tasks, and reconnects after the
    /// configured delay whenever the connection is lost. Returns an error
    /// only when the coordinator rejects this worker.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.coordinator.clone();
        let delay = self.config.reconnect_delay();

        loop {
            tracing::info!("Connecting to coordinator at {}", addr);
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    match self.run_session(stream).await {
                        Ok(SessionEnd::Rejected(reason)) => {
                            anyhow::bail!("Coordinator rejected this worker: {}", reason)
                        }
                        Ok(SessionEnd::Disconnected) => {
                            tracing::warn!("Connection closed, reconnecting...");
                        }
                        Err(e) => {
                            tracing::warn!("Session failed, reconnecting... ({:#})", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to connect to {}: {}", addr, e);
                }
            }

            sleep(delay).await;
        }
    }

    /// Serve a single connection until it closes
    pub async fn run_session<S>(&self, stream: S) -> Result<SessionEnd>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let handshake = to_frame_text(&self.handshake())?;
        write_frame(&mut writer, &handshake).await
            .context("Failed to send handshake")?;

        let reply = read_frame(&mut reader).await
            .context("Failed to read handshake reply")?
            .context("Coordinator closed connection during handshake")?;

        if let Err(reason) = parse_handshake_reply(&reply) {
            return Ok(SessionEnd::Rejected(reason));
        }
        tracing::info!("Connected, waiting for tasks");

        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(text) = results_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &text).await {
                    tracing::warn!("Failed to send result: {:#}", e);
                    break;
                }
            }
        });

        let in_flight: Arc<Mutex<HashMap<String, AbortHandle>>> = Arc::new(Mutex::new(HashMap::new()));

        loop {
            let text = match read_frame(&mut reader).await {
                Ok(Some(text)) => text,
                Ok(None) => break,
                Err(e) => {
                    tracing::info!("Connection error: {:#}", e);
                    break;
                }
            };

            match parse_coordinator_frame(&text) {
                Ok(CoordinatorFrame::KeepAlive) => {}
                Ok(CoordinatorFrame::Message(CoordinatorMessage::Compute { id, task, params })) => {
                    tracing::info!(task = %id, kind = %task, "Received compute request");
                    self.spawn_compute(id, task, params, results_tx.clone(), in_flight.clone());
                }
                Ok(CoordinatorFrame::Message(CoordinatorMessage::Abort { id })) => {
                    let handle = in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                    if let Some(handle) = handle {
                        tracing::info!(task = %id, "Aborting task");
                        handle.abort();
                    }
                }
                Err(e) => {
                    tracing::warn!("Ignoring unknown message: {:#}", e);
                }
            }
        }

        for (_, handle) in in_flight.lock().unwrap_or_else(PoisonError::into_inner).drain() {
            handle.abort();
        }
        writer_task.abort();

        Ok(SessionEnd::Disconnected)
    }

    fn spawn_compute(
        &self,
        id: String,
        task: String,
        params: Value,
        results: mpsc::UnboundedSender<String>,
        in_flight: Arc<Mutex<HashMap<String, AbortHandle>>>,
    ) {
        let handler = self.handler.clone();
        let slots = self.compute_slots.clone();
        let registry = in_flight.clone();
        let task_id = id.clone();

        // Holding the lock across spawn keeps the task from finishing (and
        // removing itself) before it is registered
        let mut guard = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let join = tokio::spawn(async move {
            let Ok(permit) = slots.acquire_owned().await else {
                return;
            };
            // The permit moves into the closure so an abort cannot release it early
            let outcome = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                handler.compute(&task, &params)
            })
            .await;
            let result = match outcome {
                Ok(result) => result,
                Err(e) => json!({ "error": format!("compute handler failed: {e}") }),
            };

            registry.lock().unwrap_or_else(PoisonError::into_inner).remove(&task_id);

            let msg = ResultMessage { id: task_id, result };
            match to_frame_text(&msg) {
                Ok(text) => {
                    let _ = results.send(text);
                }
                Err(e) => tracing::error!("Failed to encode result: {:#}", e),
            }
        });
        guard.insert(id, join.abort_handle());
    }
}

/// Load the worker token, generating and saving one if none exists
pub fn load_token(path: &Path) -> Result<String> {
    if path.is_file() {
        let token = fs::read_to_string(path)
            .with_context(|| format!("Failed to read token file: {}", path.display()))?
            .trim()
            .to_string();

        if !is_valid_token(&token) {
            anyhow::bail!("Token in {} is malformed", path.display());
        }
        return Ok(token);
    }

    let token = generate_token();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }
    fs::write(path, &token)
        .with_context(|| format!("Failed to write token file: {}", path.display()))?;
    tracing::info!("Generated new worker token in {}", path.display());

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::distributed::{Coordinator, TaskError, TaskPayload};
    use crate::registry::WorkerRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct SlowHandler;

    impl ComputeHandler for SlowHandler {
        fn compute(&self, _task: &str, params: &Value) -> Value {
            std::thread::sleep(Duration::from_millis(params["sleep_ms"].as_u64().unwrap_or(0)));
            params.clone()
        }
    }

    /// Records how many computations overlap
    #[derive(Default)]
    struct OverlapHandler {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ComputeHandler for OverlapHandler {
        fn compute(&self, _task: &str, params: &Value) -> Value {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(params["sleep_ms"].as_u64().unwrap_or(0)));
            self.active.fetch_sub(1, Ordering::SeqCst);
            params.clone()
        }
    }

    fn node(cpu_count: usize, handler: Arc<dyn ComputeHandler>) -> NodeService {
        let config = WorkerNodeConfig {
            cpu_count: Some(cpu_count),
            ..WorkerNodeConfig::default()
        };
        NodeService::with_token(config, generate_token(), handler)
    }

    fn attach(coordinator: &Coordinator, node: NodeService) -> tokio::task::JoinHandle<Result<SessionEnd>> {
        let (coord_side, node_side) = tokio::io::duplex(1 << 20);
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.handle_connection(coord_side, "127.0.0.1".to_string()).await;
        });
        tokio::spawn(async move { node.run_session(node_side).await })
    }

    #[test]
    fn test_token_generated_then_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("token.txt");

        let first = load_token(&path).unwrap();
        assert!(is_valid_token(&first));
        assert_eq!(load_token(&path).unwrap(), first);
    }

    #[test]
    fn test_malformed_token_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token.txt");
        fs::write(&path, "short").unwrap();

        assert!(load_token(&path).is_err());
    }

    #[test]
    fn test_echo_handler_reports_file_size() {
        let payload = TaskPayload::file("audio", "clip.wav", &[0u8; 48]);
        let result = EchoHandler.compute(&payload.task, &payload.params);
        assert_eq!(result, json!({ "task": "audio", "filename": "clip.wav", "bytes": 48 }));

        let result = EchoHandler.compute("audio", &json!({ "file": "%%%" }));
        assert!(result["error"].as_str().unwrap().contains("base64"));
    }

    #[test]
    fn test_handshake_describes_machine() {
        let hs = node(3, Arc::new(EchoHandler)).handshake();
        assert_eq!(hs.version, PROTOCOL_VERSION);
        assert_eq!(hs.cpu_count, 3);
        assert!(is_valid_token(&hs.token));
        assert_eq!(hs.os, std::env::consts::OS);
    }

    #[tokio::test]
    async fn test_session_serves_tasks() {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), WorkerRegistry::in_memory(true));
        let _session = attach(&coordinator, node(2, Arc::new(SlowHandler)));

        let handles: Vec<_> = (0..4)
            .map(|n| coordinator.submit(TaskPayload::new("audio", json!({ "n": n, "sleep_ms": 10 }))))
            .collect();

        for (n, handle) in handles.into_iter().enumerate() {
            let result = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
            assert_eq!(result["n"], n);
        }
    }

    #[tokio::test]
    async fn test_rejected_session() {
        let config = CoordinatorConfig::default();
        let coordinator = Coordinator::new(config, WorkerRegistry::in_memory(false));
        let session = attach(&coordinator, node(2, Arc::new(EchoHandler)));

        match session.await.unwrap().unwrap() {
            SessionEnd::Rejected(reason) => assert_eq!(reason, "Token not approved"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_task_frees_slot() {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), WorkerRegistry::in_memory(true));
        let _session = attach(&coordinator, node(1, Arc::new(SlowHandler)));

        let slow = coordinator.submit(TaskPayload::new("audio", json!({ "sleep_ms": 500 })));
        let quick = coordinator.submit(TaskPayload::new("audio", json!({ "sleep_ms": 0, "n": 1 })));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.cancel(slow.id()));
        assert_eq!(slow.wait().await, Err(TaskError::Cancelled("1".to_string())));

        let result = quick.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result["n"], 1);
    }

    #[tokio::test]
    async fn test_aborted_compute_keeps_its_cpu() {
        let coordinator = Coordinator::new(CoordinatorConfig::default(), WorkerRegistry::in_memory(true));
        let handler = Arc::new(OverlapHandler::default());
        let _session = attach(&coordinator, node(1, handler.clone()));

        let started = Instant::now();
        let slow = coordinator.submit(TaskPayload::new("audio", json!({ "sleep_ms": 300 })));
        let quick = coordinator.submit(TaskPayload::new("audio", json!({ "sleep_ms": 0, "n": 2 })));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.cancel(slow.id()));

        // The coordinator hands the freed slot to the next task right away,
        // but the node waits for the abandoned computation to return
        let result = quick.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(result["n"], 2);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    }
}
