//! Envelopes exchanged with a worker process, one JSON object per line.

use crate::error::{WorkerError, WorkerErrorKind};
use crate::interpreter::EngineError;
use crate::progress::{Checkpoint, Limits, PrintEmission, Progress, ResumeInstruction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of a `start` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    /// Script source.
    pub code: String,
    /// Names the script may call out to.
    #[serde(default)]
    pub external_functions: Vec<String>,
    /// Budget for each step of the run.
    #[serde(default)]
    pub limits: Limits,
}

/// Payload of a `resume` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    /// Checkpoint of the paused run.
    pub checkpoint: Checkpoint,
    /// Answer to the pending call.
    pub instruction: ResumeInstruction,
}

/// Request sent from the host to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Begin a new run.
    Start {
        /// Correlation id.
        id: String,
        /// Run parameters.
        payload: StartPayload,
    },
    /// Continue a paused run.
    Resume {
        /// Correlation id.
        id: String,
        /// Checkpoint and answer.
        payload: ResumePayload,
    },
}

impl WorkerRequest {
    /// Correlation id of this request.
    pub fn id(&self) -> &str {
        match self {
            WorkerRequest::Start { id, .. } | WorkerRequest::Resume { id, .. } => id,
        }
    }
}

/// Error body carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Wire kind (`syntax`, `runtime`, `limit`, `checkpoint`, `internal`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&EngineError> for SerializedError {
    fn from(err: &EngineError) -> Self {
        let details = match err {
            EngineError::Runtime { kind, message } => Some(serde_json::json!({
                "exception": { "kind": kind, "message": message }
            })),
            _ => None,
        };
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

/// Response sent from a worker to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Correlation id copied from the request.
    pub id: String,
    /// Whether the step succeeded.
    pub ok: bool,
    /// Progress of a successful step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    /// Prints emitted during the step.
    #[serde(default)]
    pub print_output: Vec<PrintEmission>,
    /// Error of a failed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl WorkerResponse {
    /// A successful response.
    pub fn success(id: String, progress: Progress, print_output: Vec<PrintEmission>) -> Self {
        Self {
            id,
            ok: true,
            progress: Some(progress),
            print_output,
            error: None,
        }
    }

    /// A failed response.
    pub fn failure(id: String, error: SerializedError, print_output: Vec<PrintEmission>) -> Self {
        Self {
            id,
            ok: false,
            progress: None,
            print_output,
            error: Some(error),
        }
    }

    /// Convert into the host-side result.
    pub fn into_result(self) -> Result<WorkerReply, WorkerError> {
        match (self.ok, self.progress, self.error) {
            (true, Some(progress), _) => Ok(WorkerReply {
                progress,
                print_output: self.print_output,
            }),
            (true, None, _) => Err(WorkerError::protocol(
                "worker response is missing progress",
            )
            .with_print_output(self.print_output)),
            (false, _, Some(error)) => Err(WorkerError::new(
                WorkerErrorKind::from_wire(&error.kind),
                error.message,
            )
            .with_details(error.details)
            .with_print_output(self.print_output)),
            (false, _, None) => Err(WorkerError::protocol(
                "worker response is missing error",
            )
            .with_print_output(self.print_output)),
        }
    }
}

/// Successful outcome of a `start` or `resume` request.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReply {
    /// Where the run stopped.
    pub progress: Progress,
    /// Prints emitted during the step.
    pub print_output: Vec<PrintEmission>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let request = WorkerRequest::Start {
            id: "r1".into(),
            payload: StartPayload {
                code: "(echo 1)".into(),
                external_functions: vec!["echo".into()],
                limits: Limits::default(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "start");
        assert_eq!(value["id"], "r1");
        assert_eq!(value["payload"]["code"], "(echo 1)");

        let parsed: WorkerRequest = serde_json::from_value(json!({
            "id": "r2",
            "kind": "start",
            "payload": {"code": "1", "limits": {"max_steps": 10}}
        }))
        .unwrap();
        match parsed {
            WorkerRequest::Start { id, payload } => {
                assert_eq!(id, "r2");
                assert!(payload.external_functions.is_empty());
                assert_eq!(payload.limits.max_steps, 10);
                assert_eq!(payload.limits.max_depth, Limits::default().max_depth);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failed_response_maps_to_worker_error() {
        let response: WorkerResponse = serde_json::from_value(json!({
            "id": "r1",
            "ok": false,
            "error": {"kind": "runtime", "message": "RuntimeError: boom"},
            "print_output": [{"values": ["a"], "end": "\n"}]
        }))
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind, WorkerErrorKind::Runtime);
        assert_eq!(err.message, "RuntimeError: boom");
        assert_eq!(err.print_output.len(), 1);
    }

    #[test]
    fn successful_response_without_progress_is_a_protocol_error() {
        let response = WorkerResponse {
            id: "r1".into(),
            ok: true,
            progress: None,
            print_output: Vec::new(),
            error: None,
        };
        assert_eq!(
            response.into_result().unwrap_err().kind,
            WorkerErrorKind::WorkerProtocol
        );
    }
}
