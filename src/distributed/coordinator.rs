//! Coordinator
//!
//! The coordinator owns the dispatch state and the worker registry. It:
//! - Accepts worker connections and runs the gateway handshake
//! - Spawns one receive loop and one writer per admitted worker
//! - Exposes the submission API to external callers
//! - Sends periodic keep-alives
//!
//! All dispatch state sits behind a single mutex that is never held across
//! an await point; outbound frames go through each connection's writer.

use super::correlator::{self, FrameOutcome};
use super::dispatcher::{DispatchState, Orphans, PoolStats, TaskState};
use super::gateway::{self, Admission};
use super::handle::CompletionHandle;
use super::pool::{ConnectionId, PlatformInfo, WorkerConnection, WorkerLink, WorkerSummary};
use super::protocol::write_frame;
use super::task::{TaskId, TaskPayload};
use crate::config::CoordinatorConfig;
use crate::registry::WorkerRegistry;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a running coordinator, cheap to clone
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<DispatchState>,
    registry: WorkerRegistry,
    config: CoordinatorConfig,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Coordinator {
    /// Create a coordinator with an empty pool and queue
    pub fn new(config: CoordinatorConfig, registry: WorkerRegistry) -> Self {
        let state = DispatchState::new(config.orphan_policy);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                registry,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    /// Submit a task
    ///
    /// Enqueues the task, runs a dispatch pass and returns immediately. The
    /// handle resolves once a worker reports the task's result.
    pub fn submit(&self, payload: TaskPayload) -> CompletionHandle {
        let mut state = self.inner.state();
        let handle = state.submit(payload);
        tracing::debug!(task = %handle.id(), "Task submitted");
        state.dispatch();
        handle
    }

    /// Cancel a queued or running task
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.inner.state();
        let found = state.cancel(id);
        if found {
            state.dispatch();
        }
        found
    }

    pub fn task_state(&self, id: TaskId) -> TaskState {
        self.inner.state().task_state(id)
    }

    /// Connected workers, without credentials
    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.inner.state().workers()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.state().stats()
    }

    /// Add an admitted worker to the pool and give it work
    pub fn register(&self, admission: Admission, link: WorkerLink, host: String) -> ConnectionId {
        let Admission {
            identity,
            handshake,
            max_tasks,
            ..
        } = admission;

        let mut state = self.inner.state();
        let id = state.next_connection_id();

        tracing::info!(
            connection = %id,
            nickname = %identity.nickname,
            %host,
            max_tasks,
            "Worker joined pool"
        );

        state.register(WorkerConnection {
            id,
            identity,
            link,
            max_tasks,
            host,
            platform: PlatformInfo {
                platform: handshake.platform,
                os: handshake.os,
                cpu: handshake.cpu,
                cpu_count: handshake.cpu_count,
            },
            connected_at: Utc::now(),
        });
        state.dispatch();

        id
    }

    /// Process one frame received from a worker
    pub fn handle_frame(&self, connection: ConnectionId, text: &str) -> FrameOutcome {
        let mut state = self.inner.state();
        let outcome = correlator::correlate(&mut state, connection, text);
        if matches!(outcome, FrameOutcome::Completed(_)) {
            state.dispatch();
        }
        outcome
    }

    /// Drop a worker whose connection closed
    pub fn disconnect(&self, connection: ConnectionId) -> Orphans {
        let mut state = self.inner.state();
        let orphans = state.disconnect(connection);
        state.dispatch();
        orphans
    }

    /// Serve one connection from handshake to close
    ///
    /// Rejected connections are answered and dropped; admitted ones stay in
    /// the pool until their receive loop ends.
    pub async fn handle_connection<S>(&self, stream: S, host: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let admission = match gateway::handshake(&mut reader, &mut writer, self.registry(), self.config()).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::warn!(%host, "Rejected worker: {}", e);
                return;
            }
        };

        let (link, outbound) = WorkerLink::channel();
        let writer_task = tokio::spawn(write_loop(writer, outbound));

        let connection = self.register(admission, link, host);
        correlator::receive_loop(self, connection, &mut reader).await;

        let orphans = self.disconnect(connection);
        if !orphans.is_empty() {
            tracing::warn!(%connection, ?orphans, "Worker left with running tasks");
        }
        writer_task.abort();
    }

    /// Bind `addr` and accept worker connections forever
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind worker listener on {}", addr))?;

        tracing::info!("Accepting workers on {}", addr);
        self.accept_loop(listener).await
    }

    /// Accept worker connections on a bound listener
    pub async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
            }

            tracing::info!(%peer, "Worker connected, validating");
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.handle_connection(stream, peer.ip().to_string()).await;
            });
        }
    }

    /// Send a keep-alive to every worker at the configured interval
    ///
    /// The task stops once the last coordinator handle is dropped.
    pub fn spawn_keepalive(&self) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.config().keepalive_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.state().keepalive();
            }
        })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Drain a connection's outbound frames onto its stream
async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(text) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &text).await {
            tracing::debug!("Worker write failed: {:#}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrphanPolicy;
    use crate::distributed::error::TaskError;
    use crate::distributed::protocol::{
        parse_coordinator_frame, read_frame, to_frame_text, CoordinatorFrame, CoordinatorMessage, Handshake,
        ResultMessage, PROTOCOL_VERSION,
    };
    use crate::registry::generate_token;
    use serde_json::{json, Value};
    use tokio::io::DuplexStream;

    struct FakeWorker {
        stream: DuplexStream,
    }

    impl FakeWorker {
        async fn connect(coordinator: &Coordinator, cpu_count: usize) -> Self {
            let mut worker = Self::dial(coordinator).await;
            let reply = worker.handshake(PROTOCOL_VERSION, cpu_count).await;
            assert_eq!(reply, "Success");
            worker
        }

        async fn dial(coordinator: &Coordinator) -> Self {
            let (coord_side, worker_side) = tokio::io::duplex(1 << 20);
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator.handle_connection(coord_side, "127.0.0.1".to_string()).await;
            });
            Self { stream: worker_side }
        }

        async fn handshake(&mut self, version: u32, cpu_count: usize) -> String {
            let hs = Handshake {
                token: generate_token(),
                version,
                cpu_count,
                platform: "test".to_string(),
                os: "linux".to_string(),
                cpu: Value::Null,
            };
            write_frame(&mut self.stream, &to_frame_text(&hs).unwrap()).await.unwrap();
            read_frame(&mut self.stream).await.unwrap().unwrap()
        }

        async fn next_compute(&mut self) -> (String, Value) {
            loop {
                let text = read_frame(&mut self.stream).await.unwrap().unwrap();
                match parse_coordinator_frame(&text).unwrap() {
                    CoordinatorFrame::KeepAlive => continue,
                    CoordinatorFrame::Message(CoordinatorMessage::Compute { id, params, .. }) => {
                        return (id, params)
                    }
                    CoordinatorFrame::Message(other) => panic!("unexpected message {other:?}"),
                }
            }
        }

        async fn reply(&mut self, id: &str, result: Value) {
            let msg = ResultMessage {
                id: id.to_string(),
                result,
            };
            write_frame(&mut self.stream, &to_frame_text(&msg).unwrap()).await.unwrap();
        }
    }

    fn coordinator(policy: OrphanPolicy) -> Coordinator {
        let config = CoordinatorConfig {
            orphan_policy: policy,
            ..CoordinatorConfig::default()
        };
        Coordinator::new(config, WorkerRegistry::in_memory(true))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_five_tasks_on_two_slots() {
        let coord = coordinator(OrphanPolicy::Fail);
        let handles: Vec<_> = (0..5)
            .map(|n| coord.submit(TaskPayload::new("audio", json!({ "n": n }))))
            .collect();

        let mut worker = FakeWorker::connect(&coord, 2).await;

        let (first, _) = worker.next_compute().await;
        let (second, _) = worker.next_compute().await;
        assert_eq!((first.as_str(), second.as_str()), ("1", "2"));
        assert_eq!(coord.stats().running, 2);
        assert_eq!(coord.stats().queued, 3);

        worker.reply(&first, json!("r1")).await;
        let (third, params) = worker.next_compute().await;
        assert_eq!(third, "3");
        assert_eq!(params, json!({ "n": 2 }));

        worker.reply(&second, json!("r2")).await;
        assert_eq!(worker.next_compute().await.0, "4");
        worker.reply(&third, json!("r3")).await;
        assert_eq!(worker.next_compute().await.0, "5");
        worker.reply("4", json!("r4")).await;
        worker.reply("5", json!("r5")).await;

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.wait().await.unwrap());
        }
        assert_eq!(results, vec![json!("r1"), json!("r2"), json!("r3"), json!("r4"), json!("r5")]);
        assert_eq!(coord.stats().completed, 5);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected_and_closed() {
        let coord = coordinator(OrphanPolicy::Fail);
        let mut worker = FakeWorker::dial(&coord).await;

        let reply = worker.handshake(PROTOCOL_VERSION + 1, 4).await;
        assert_eq!(reply, "Error: Please upgrade to the latest version 1 (You're on 2)");
        assert_eq!(read_frame(&mut worker.stream).await.unwrap(), None);
        assert!(coord.workers().is_empty());
    }

    #[tokio::test]
    async fn test_lost_worker_fails_its_tasks() {
        let coord = coordinator(OrphanPolicy::Fail);
        let mut worker = FakeWorker::connect(&coord, 2).await;
        wait_until(|| coord.workers().len() == 1).await;

        let first = coord.submit(TaskPayload::new("audio", Value::Null));
        let second = coord.submit(TaskPayload::new("audio", Value::Null));
        worker.next_compute().await;
        worker.next_compute().await;

        drop(worker);

        assert!(matches!(first.wait().await, Err(TaskError::WorkerLost { .. })));
        assert!(matches!(second.wait().await, Err(TaskError::WorkerLost { .. })));
        wait_until(|| coord.workers().is_empty()).await;
    }

    #[tokio::test]
    async fn test_lost_worker_tasks_move_to_survivor() {
        let coord = coordinator(OrphanPolicy::Requeue);
        let mut doomed = FakeWorker::connect(&coord, 1).await;
        wait_until(|| coord.workers().len() == 1).await;

        let handle = coord.submit(TaskPayload::new("audio", Value::Null));
        let (id, _) = doomed.next_compute().await;
        drop(doomed);
        wait_until(|| coord.workers().is_empty()).await;
        assert_eq!(coord.task_state(handle.id()), TaskState::Queued);

        let mut survivor = FakeWorker::connect(&coord, 1).await;
        let (again, _) = survivor.next_compute().await;
        assert_eq!(again, id);
        survivor.reply(&again, json!({"ok": true})).await;
        assert_eq!(handle.wait().await, Ok(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_keepalive_reaches_workers() {
        let config = CoordinatorConfig {
            keepalive_interval_secs: 1,
            ..CoordinatorConfig::default()
        };
        let coord = Coordinator::new(config, WorkerRegistry::in_memory(true));
        let mut worker = FakeWorker::connect(&coord, 1).await;
        wait_until(|| coord.workers().len() == 1).await;

        let keepalive = coord.spawn_keepalive();
        let text = read_frame(&mut worker.stream).await.unwrap().unwrap();
        assert_eq!(text, "1");
        keepalive.abort();
    }
}
