//! Host-side pool of worker processes, one per worker key.
//!
//! Each worker runs three tasks: a writer draining the outbound line channel
//! into the child's stdin, a reader dispatching response lines to pending
//! requests, and a supervisor that owns the [`Child`], notices its exit and
//! performs graceful termination on stop. Both maps (key → worker, id →
//! pending request) live in one [`Registry`] behind a single mutex that is
//! never held across an `.await`.

use super::ScriptBackend;
use super::protocol::{ResumePayload, StartPayload, WorkerReply, WorkerRequest, WorkerResponse};
use crate::config::RlmConfig;
use crate::error::WorkerError;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

/// Name of the worker executable looked up next to the current executable.
pub const WORKER_BINARY_NAME: &str = "rlm-worker";

const TIMEOUT_MESSAGE: &str = "Worker request timed out.";
const STOPPED_MESSAGE: &str = "Worker pool was stopped before request completion.";

/// Builds the command that launches a worker process.
pub trait WorkerLauncher: Send + Sync {
    /// Command for a new worker dedicated to `worker_key`. Stdio and
    /// `kill_on_drop` are configured by the pool.
    fn command(&self, worker_key: &str) -> Command;
}

/// Launches a worker executable with fixed arguments.
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl BinaryLauncher {
    /// Launch `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launcher described by configuration, falling back to a binary named
    /// [`WORKER_BINARY_NAME`] next to the current executable.
    pub fn from_config(config: &RlmConfig) -> Self {
        let program = config
            .worker
            .program
            .clone()
            .unwrap_or_else(default_worker_path);
        Self::new(program, config.worker.args.clone())
    }

    /// Program this launcher runs.
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

fn default_worker_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY_NAME)))
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY_NAME))
}

impl WorkerLauncher for BinaryLauncher {
    fn command(&self, worker_key: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).env("RLM_WORKER_KEY", worker_key);
        command
    }
}

/// Timeouts applied by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// How long a request may wait for its response.
    pub request_timeout: Duration,
    /// How long a stopped worker may take to exit after SIGTERM.
    pub stop_grace: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(1),
        }
    }
}

impl PoolOptions {
    /// Options taken from configuration.
    pub fn from_config(config: &RlmConfig) -> Self {
        Self {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
        }
    }
}

type Completion = oneshot::Sender<Result<WorkerReply, WorkerError>>;

struct PendingRequest {
    worker_key: String,
    generation: u64,
    tx: Completion,
}

struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<String>,
    stop: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<String, WorkerHandle>,
    pending: HashMap<String, PendingRequest>,
}

#[derive(Default)]
struct Registry {
    state: Mutex<PoolState>,
}

impl Registry {
    fn complete(&self, response: WorkerResponse) {
        let pending = self.state.lock().pending.remove(&response.id);
        match pending {
            Some(pending) => {
                let _ = pending.tx.send(response.into_result());
            }
            None => tracing::debug!(request_id = %response.id, "dropping response for unknown request"),
        }
    }

    fn forget(&self, id: &str) {
        self.state.lock().pending.remove(id);
    }

    /// Drop the worker entry for this generation and fail its pending requests.
    fn handle_exit(&self, worker_key: &str, generation: u64, reason: &str) {
        let rejected: Vec<Completion> = {
            let mut state = self.state.lock();
            if state
                .workers
                .get(worker_key)
                .is_some_and(|handle| handle.generation == generation)
            {
                state.workers.remove(worker_key);
                tracing::warn!(worker_key, generation, reason, "worker exited");
            }
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, pending)| {
                    pending.worker_key == worker_key && pending.generation == generation
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.pending.remove(id))
                .map(|pending| pending.tx)
                .collect()
        };
        for tx in rejected {
            let _ = tx.send(Err(WorkerError::crash(reason)));
        }
    }
}

/// Process-isolated [`ScriptBackend`].
pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    options: PoolOptions,
    registry: Arc<Registry>,
    next_generation: AtomicU64,
}

static SHARED_POOL: OnceLock<Arc<WorkerPool>> = OnceLock::new();

impl WorkerPool {
    /// Pool launching workers through `launcher`.
    pub fn new(launcher: Arc<dyn WorkerLauncher>, options: PoolOptions) -> Self {
        Self {
            launcher,
            options,
            registry: Arc::new(Registry::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Pool described by configuration.
    pub fn from_config(config: &RlmConfig) -> Self {
        Self::new(
            Arc::new(BinaryLauncher::from_config(config)),
            PoolOptions::from_config(config),
        )
    }

    /// Process-wide pool, configured from the environment on first use.
    pub fn shared() -> Arc<WorkerPool> {
        SHARED_POOL
            .get_or_init(|| {
                let config = RlmConfig::from_env().unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "invalid worker environment; using defaults");
                    RlmConfig::default()
                });
                Arc::new(WorkerPool::from_config(&config))
            })
            .clone()
    }

    /// Stop the process-wide pool if it was ever created.
    pub async fn shutdown_shared() {
        if let Some(pool) = SHARED_POOL.get() {
            pool.stop().await;
        }
    }

    /// Number of live worker processes.
    pub fn worker_count(&self) -> usize {
        self.registry.state.lock().workers.len()
    }

    /// OS process id of the worker for `worker_key`, if one is live.
    pub fn worker_pid(&self, worker_key: &str) -> Option<u32> {
        self.registry
            .state
            .lock()
            .workers
            .get(worker_key)
            .and_then(|handle| handle.pid)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.registry.state.lock().pending.len()
    }

    /// Begin a run on the worker for `worker_key`.
    pub async fn start(
        &self,
        worker_key: &str,
        payload: StartPayload,
    ) -> Result<WorkerReply, WorkerError> {
        self.request(worker_key, |id| WorkerRequest::Start { id, payload })
            .await
    }

    /// Resume a paused run on the worker for `worker_key`.
    pub async fn resume(
        &self,
        worker_key: &str,
        payload: ResumePayload,
    ) -> Result<WorkerReply, WorkerError> {
        self.request(worker_key, |id| WorkerRequest::Resume { id, payload })
            .await
    }

    /// Fail every pending request and terminate every worker.
    pub async fn stop(&self) {
        let (workers, pending) = {
            let mut state = self.registry.state.lock();
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.pending),
            )
        };

        for (_, pending) in pending {
            let _ = pending.tx.send(Err(WorkerError::crash(STOPPED_MESSAGE)));
        }

        let mut supervisors = Vec::with_capacity(workers.len());
        for (worker_key, mut handle) in workers {
            tracing::info!(worker_key = %worker_key, pid = ?handle.pid, "stopping worker");
            if let Some(stop) = handle.stop.take() {
                let _ = stop.send(());
            }
            if let Some(supervisor) = handle.supervisor.take() {
                supervisors.push(supervisor);
            }
        }
        for result in futures::future::join_all(supervisors).await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "worker supervisor failed");
            }
        }
    }

    async fn request(
        &self,
        worker_key: &str,
        build: impl FnOnce(String) -> WorkerRequest,
    ) -> Result<WorkerReply, WorkerError> {
        let id = Uuid::new_v4().to_string();
        let line = serde_json::to_string(&build(id.clone()))
            .map_err(|err| WorkerError::protocol(format!("failed to encode request: {err}")))?;

        let (tx, rx) = oneshot::channel();
        let outbound = {
            let mut state = self.registry.state.lock();
            let (generation, outbound) = match state.workers.get(worker_key) {
                Some(handle) => (handle.generation, handle.outbound.clone()),
                None => {
                    let handle = self.spawn_worker(worker_key)?;
                    let entry = (handle.generation, handle.outbound.clone());
                    state.workers.insert(worker_key.to_string(), handle);
                    entry
                }
            };
            state.pending.insert(
                id.clone(),
                PendingRequest {
                    worker_key: worker_key.to_string(),
                    generation,
                    tx,
                },
            );
            outbound
        };

        if outbound.send(line).is_err() {
            self.registry.forget(&id);
            return Err(WorkerError::crash("worker input channel is closed"));
        }

        match timeout(self.options.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::crash("worker dropped the request")),
            Err(_) => {
                self.registry.forget(&id);
                tracing::warn!(worker_key, request_id = %id, "worker request timed out");
                Err(WorkerError::protocol(TIMEOUT_MESSAGE))
            }
        }
    }

    fn spawn_worker(&self, worker_key: &str) -> Result<WorkerHandle, WorkerError> {
        let mut command = self.launcher.command(worker_key);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| WorkerError::crash(format!("failed to spawn worker: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::crash("worker process did not expose stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::crash("worker process did not expose stdout"))?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let key = worker_key.to_string();

        tokio::spawn(write_loop(
            stdin,
            outbound_rx,
            Arc::clone(&self.registry),
            key.clone(),
            generation,
        ));
        tokio::spawn(read_loop(
            stdout,
            Arc::clone(&self.registry),
            key.clone(),
            generation,
        ));
        let supervisor = tokio::spawn(supervise(
            child,
            stop_rx,
            Arc::clone(&self.registry),
            key,
            generation,
            self.options.stop_grace,
        ));

        tracing::info!(worker_key, ?pid, generation, "spawned worker");
        Ok(WorkerHandle {
            generation,
            pid,
            outbound: outbound_tx,
            stop: Some(stop_tx),
            supervisor: Some(supervisor),
        })
    }
}

#[async_trait]
impl ScriptBackend for WorkerPool {
    async fn start(
        &self,
        worker_key: &str,
        payload: StartPayload,
    ) -> Result<WorkerReply, WorkerError> {
        WorkerPool::start(self, worker_key, payload).await
    }

    async fn resume(
        &self,
        worker_key: &str,
        payload: ResumePayload,
    ) -> Result<WorkerReply, WorkerError> {
        WorkerPool::resume(self, worker_key, payload).await
    }

    async fn stop(&self) {
        WorkerPool::stop(self).await
    }
}

async fn write_loop(
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<String>,
    registry: Arc<Registry>,
    worker_key: String,
    generation: u64,
) {
    while let Some(mut line) = outbound.recv().await {
        line.push('\n');
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            registry.handle_exit(
                &worker_key,
                generation,
                &format!("failed to write to worker: {err}"),
            );
            return;
        }
    }
}

async fn read_loop(
    stdout: ChildStdout,
    registry: Arc<Registry>,
    worker_key: String,
    generation: u64,
) {
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerResponse>(&line) {
                    Ok(response) => registry.complete(response),
                    Err(err) => {
                        tracing::warn!(worker_key = %worker_key, error = %err, "discarding malformed worker output");
                    }
                }
            }
            Ok(None) => break "worker closed its output".to_string(),
            Err(err) => break format!("failed to read from worker: {err}"),
        }
    };
    registry.handle_exit(&worker_key, generation, &reason);
}

async fn supervise(
    mut child: Child,
    mut stop: oneshot::Receiver<()>,
    registry: Arc<Registry>,
    worker_key: String,
    generation: u64,
    grace: Duration,
) {
    let reason = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => format!("worker process exited ({status})"),
            Err(err) => format!("failed to wait on worker process: {err}"),
        },
        _ = &mut stop => {
            terminate(&mut child, grace).await;
            "worker process was stopped".to_string()
        }
    };
    registry.handle_exit(&worker_key, generation, &reason);
}

/// SIGTERM, then SIGKILL once `grace` elapses.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                if timeout(grace, child.wait()).await.is_ok() {
                    return;
                }
                tracing::warn!(pid, "worker ignored SIGTERM; killing");
            }
            Err(err) => tracing::debug!(pid, error = %err, "SIGTERM failed"),
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "failed to kill worker");
    }
}
