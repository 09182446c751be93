//! Error types shared across the worker pool and the execution loop.

use crate::interpreter::EngineError;
use crate::progress::{PrintEmission, SnapshotError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, RlmError>;

/// Category of a worker-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// Script source failed to parse.
    Syntax,
    /// An exception escaped the script.
    Runtime,
    /// The script exhausted a resource budget.
    Limit,
    /// A checkpoint could not be loaded or replayed.
    Checkpoint,
    /// Unexpected failure inside the worker.
    Internal,
    /// The worker process died or was stopped with the request outstanding.
    WorkerCrash,
    /// The worker did not answer in time or answered nonsense.
    WorkerProtocol,
}

impl WorkerErrorKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerErrorKind::Syntax => "syntax",
            WorkerErrorKind::Runtime => "runtime",
            WorkerErrorKind::Limit => "limit",
            WorkerErrorKind::Checkpoint => "checkpoint",
            WorkerErrorKind::Internal => "internal",
            WorkerErrorKind::WorkerCrash => "worker_crash",
            WorkerErrorKind::WorkerProtocol => "worker_protocol",
        }
    }

    /// Parse a wire name; unknown names map to [`WorkerErrorKind::Internal`].
    pub fn from_wire(name: &str) -> Self {
        match name {
            "syntax" => WorkerErrorKind::Syntax,
            "runtime" => WorkerErrorKind::Runtime,
            "limit" => WorkerErrorKind::Limit,
            "checkpoint" => WorkerErrorKind::Checkpoint,
            "worker_crash" => WorkerErrorKind::WorkerCrash,
            "worker_protocol" => WorkerErrorKind::WorkerProtocol,
            _ => WorkerErrorKind::Internal,
        }
    }

    /// Whether the failure came from the transport rather than the script.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            WorkerErrorKind::WorkerCrash | WorkerErrorKind::WorkerProtocol
        )
    }
}

impl fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a `start` or `resume` request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct WorkerError {
    /// Failure category.
    pub kind: WorkerErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured details reported by the worker.
    pub details: Option<Value>,
    /// Prints the script emitted before failing.
    pub print_output: Vec<PrintEmission>,
}

impl WorkerError {
    /// Construct an error of the given kind.
    pub fn new(kind: WorkerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            print_output: Vec::new(),
        }
    }

    /// The worker process went away.
    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::WorkerCrash, message)
    }

    /// The worker timed out or broke the protocol.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::WorkerProtocol, message)
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }

    /// Attach prints emitted before the failure.
    pub fn with_print_output(mut self, print_output: Vec<PrintEmission>) -> Self {
        self.print_output = print_output;
        self
    }
}

impl From<EngineError> for WorkerError {
    fn from(err: EngineError) -> Self {
        let kind = WorkerErrorKind::from_wire(err.kind());
        WorkerError::new(kind, err.to_string())
    }
}

/// Errors returned by [`crate::execution::RlmRuntime`].
#[derive(Debug, Error)]
pub enum RlmError {
    /// The backend failed the run.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// A history record could not be persisted; the run was abandoned.
    #[error("history write failed: {0}")]
    History(String),

    /// A stored checkpoint could not be decoded.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The tool executor cancelled the run; its tool-call record is the last
    /// one written, so the run can still be recovered.
    #[error("run aborted: {0}")]
    Aborted(String),
}

/// Failure turning script arguments into a tool's argument object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// More positional arguments than declared parameters.
    #[error("{tool} accepts at most {max} positional arguments, got {given}")]
    TooManyPositional {
        /// Tool name.
        tool: String,
        /// Declared parameter count.
        max: usize,
        /// Supplied positional count.
        given: usize,
    },

    /// The same parameter was passed positionally and by keyword.
    #[error("{tool} got multiple values for argument '{name}'")]
    DuplicateArgument {
        /// Tool name.
        tool: String,
        /// Parameter name.
        name: String,
    },

    /// A keyword does not name a declared parameter.
    #[error("{tool} got an unexpected argument '{name}'")]
    UnknownArgument {
        /// Tool name.
        tool: String,
        /// Offending keyword.
        name: String,
    },

    /// A required parameter was not supplied.
    #[error("{tool} is missing required argument '{name}'")]
    MissingRequired {
        /// Tool name.
        tool: String,
        /// Parameter name.
        name: String,
    },

    /// A value does not match the declared parameter type.
    #[error("{tool} argument '{name}' must be {expected}, got {found}")]
    TypeMismatch {
        /// Tool name.
        tool: String,
        /// Parameter name.
        name: String,
        /// Declared JSON type.
        expected: String,
        /// Supplied JSON type.
        found: String,
    },
}
