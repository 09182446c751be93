//! Worker-side NDJSON loop.
//!
//! The worker reads one request per line, runs it against an [`Interpreter`],
//! and writes exactly one response line per request that carried an id.
//! Requests are handled strictly in order.

use super::protocol::{SerializedError, WorkerRequest, WorkerResponse};
use crate::interpreter::{Engine, Interpreter};
use serde_json::Value;
use std::io::{self, BufRead, Write};

/// Request loop hosted by the `rlm-worker` binary.
pub struct WorkerService<I = Engine> {
    interpreter: I,
}

impl WorkerService<Engine> {
    /// Service backed by the built-in engine.
    pub fn new() -> Self {
        Self {
            interpreter: Engine::new(),
        }
    }
}

impl Default for WorkerService<Engine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Interpreter> WorkerService<I> {
    /// Service backed by a custom interpreter.
    pub fn with_interpreter(interpreter: I) -> Self {
        Self { interpreter }
    }

    /// Serve requests from `reader` until end of input.
    pub fn handle<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line) {
                serde_json::to_writer(&mut writer, &response)?;
                writer.write_all(b"\n")?;
                writer.flush()?;
            }
        }
        tracing::debug!("worker input closed");
        Ok(())
    }

    /// Answer a single request line. Lines without a usable id get no answer.
    pub fn handle_line(&self, line: &str) -> Option<WorkerResponse> {
        let raw: Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed request line");
                return None;
            }
        };
        let Some(id) = raw.get("id").and_then(Value::as_str).map(str::to_string) else {
            tracing::warn!("ignoring request without an id");
            return None;
        };
        match serde_json::from_value::<WorkerRequest>(raw) {
            Ok(request) => Some(self.handle_request(request)),
            Err(err) => Some(WorkerResponse::failure(
                id,
                SerializedError {
                    kind: "internal".to_string(),
                    message: format!("malformed request: {err}"),
                    details: None,
                },
                Vec::new(),
            )),
        }
    }

    /// Run a decoded request.
    pub fn handle_request(&self, request: WorkerRequest) -> WorkerResponse {
        let (id, step) = match request {
            WorkerRequest::Start { id, payload } => {
                tracing::debug!(request_id = %id, "start");
                let step = self.interpreter.create_run(
                    &payload.code,
                    &payload.external_functions,
                    payload.limits,
                );
                (id, step)
            }
            WorkerRequest::Resume { id, payload } => {
                tracing::debug!(request_id = %id, "resume");
                let step = self
                    .interpreter
                    .resume_run(&payload.checkpoint, &payload.instruction);
                (id, step)
            }
        };

        match step.outcome {
            Ok(progress) => WorkerResponse::success(id, progress, step.prints),
            Err(err) => {
                tracing::debug!(request_id = %id, kind = err.kind(), error = %err, "run failed");
                WorkerResponse::failure(id, SerializedError::from(&err), step.prints)
            }
        }
    }
}
