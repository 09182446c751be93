//! Backends that execute script steps.
//!
//! [`WorkerPool`] runs each worker key in its own `rlm-worker` process and
//! talks to it over newline-delimited JSON ([`protocol`]). [`LocalBackend`]
//! runs the same interpreter in-process. The execution loop only sees the
//! [`ScriptBackend`] trait.

/// In-process backend.
pub mod local;
/// Host-side worker process pool.
pub mod pool;
/// Request and response envelopes.
pub mod protocol;
/// Worker-side request loop.
pub mod service;

pub use local::LocalBackend;
pub use pool::{BinaryLauncher, PoolOptions, WORKER_BINARY_NAME, WorkerLauncher, WorkerPool};
pub use protocol::{
    ResumePayload, SerializedError, StartPayload, WorkerReply, WorkerRequest, WorkerResponse,
};
pub use service::WorkerService;

use crate::error::WorkerError;
use async_trait::async_trait;

/// Executes `start`/`resume` steps for a worker key.
#[async_trait]
pub trait ScriptBackend: Send + Sync {
    /// Begin a new run.
    async fn start(
        &self,
        worker_key: &str,
        payload: StartPayload,
    ) -> Result<WorkerReply, WorkerError>;

    /// Resume a paused run.
    async fn resume(
        &self,
        worker_key: &str,
        payload: ResumePayload,
    ) -> Result<WorkerReply, WorkerError>;

    /// Release every resource held by the backend.
    async fn stop(&self);
}
