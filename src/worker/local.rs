//! In-process backend.

use super::ScriptBackend;
use super::protocol::{ResumePayload, StartPayload, WorkerReply};
use crate::error::WorkerError;
use crate::interpreter::{Engine, Interpreter, RunStep};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs scripts on a blocking task inside the host process.
///
/// There is no isolation: a runaway script is bounded only by its limits.
/// Checkpoints are interchangeable with those produced by worker processes.
#[derive(Clone)]
pub struct LocalBackend {
    interpreter: Arc<dyn Interpreter>,
}

impl LocalBackend {
    /// Backend using the built-in engine.
    pub fn new() -> Self {
        Self::with_interpreter(Arc::new(Engine::new()))
    }

    /// Backend using a custom interpreter.
    pub fn with_interpreter(interpreter: Arc<dyn Interpreter>) -> Self {
        Self { interpreter }
    }

    async fn run(
        &self,
        job: impl FnOnce(&dyn Interpreter) -> RunStep + Send + 'static,
    ) -> Result<WorkerReply, WorkerError> {
        let interpreter = Arc::clone(&self.interpreter);
        let step = tokio::task::spawn_blocking(move || job(interpreter.as_ref()))
            .await
            .map_err(|err| WorkerError::crash(format!("interpreter task failed: {err}")))?;
        match step.outcome {
            Ok(progress) => Ok(WorkerReply {
                progress,
                print_output: step.prints,
            }),
            Err(err) => Err(WorkerError::from(err).with_print_output(step.prints)),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptBackend for LocalBackend {
    async fn start(
        &self,
        _worker_key: &str,
        payload: StartPayload,
    ) -> Result<WorkerReply, WorkerError> {
        self.run(move |interpreter| {
            interpreter.create_run(&payload.code, &payload.external_functions, payload.limits)
        })
        .await
    }

    async fn resume(
        &self,
        _worker_key: &str,
        payload: ResumePayload,
    ) -> Result<WorkerReply, WorkerError> {
        self.run(move |interpreter| {
            interpreter.resume_run(&payload.checkpoint, &payload.instruction)
        })
        .await
    }

    async fn stop(&self) {}
}
