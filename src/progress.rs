//! Values exchanged between the interpreter, the worker processes, and the host loop.
//!
//! Everything in this module is transport-neutral: values are JSON, checkpoints are
//! opaque bytes, and every type serializes to the same shape on the wire and in
//! durable history records.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Exception kind injected when a run is recovered after a host restart.
pub const RESTART_EXCEPTION_KIND: &str = "RuntimeError";
/// Message injected when a run is recovered after a host restart.
pub const RESTART_EXCEPTION_MESSAGE: &str = "Process was restarted";

/// Result of one `start`/`resume` step of a script run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Progress {
    /// The script is suspended at a call to an external function.
    Paused {
        /// Name of the external function being called.
        function_name: String,
        /// Positional arguments.
        args: Vec<Value>,
        /// Keyword arguments.
        kwargs: Map<String, Value>,
        /// Continuation captured at this call site.
        checkpoint: Checkpoint,
    },
    /// The script ran to completion.
    Finished {
        /// Value of the last top-level expression.
        output: Value,
    },
}

/// What to feed back into a paused run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeInstruction {
    /// The external call succeeded with this value.
    ReturnValue(Value),
    /// The external call failed; the script sees a raised exception.
    Exception(ExceptionInfo),
}

impl ResumeInstruction {
    /// Build an exception instruction.
    pub fn exception(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ResumeInstruction::Exception(ExceptionInfo {
            kind: kind.into(),
            message: message.into(),
        })
    }

    /// The synthetic exception used when recovering after a host restart.
    pub fn restarted() -> Self {
        Self::exception(RESTART_EXCEPTION_KIND, RESTART_EXCEPTION_MESSAGE)
    }
}

/// Exception raised inside the script when an external call fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Exception kind, e.g. `RuntimeError`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// One `print`/`write` event emitted by a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintEmission {
    /// Printed values, in argument order.
    pub values: Vec<Value>,
    /// Terminator appended after the rendered values.
    #[serde(default)]
    pub end: String,
}

impl PrintEmission {
    /// A `print` emission terminated by a newline.
    pub fn line(values: Vec<Value>) -> Self {
        Self {
            values,
            end: "\n".to_string(),
        }
    }

    /// A `write` emission with no terminator.
    pub fn raw(values: Vec<Value>) -> Self {
        Self {
            values,
            end: String::new(),
        }
    }
}

/// Resource budget for a single start/resume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum evaluation steps.
    pub max_steps: u64,
    /// Maximum expression nesting depth.
    pub max_depth: usize,
    /// Wall-clock budget in milliseconds; restarts on every resume.
    pub max_duration_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_depth: 100,
            max_duration_ms: 30_000,
        }
    }
}

/// Errors raised while decoding a stored checkpoint.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The stored text is not valid base64.
    #[error("checkpoint is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// The stored text decoded to nothing.
    #[error("checkpoint is empty")]
    Empty,
}

/// Opaque interpreter continuation.
///
/// The host never looks inside; it only stores the bytes as base64 text and hands
/// them back to an interpreter. Serializes as a base64 string.
#[derive(Clone, PartialEq, Eq)]
pub struct Checkpoint(Vec<u8>);

impl Checkpoint {
    /// Wrap raw checkpoint bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw checkpoint bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Encode to the text form used for durable storage.
    pub fn encode(&self) -> String {
        STANDARD.encode(&self.0)
    }

    /// Decode from the text form used for durable storage.
    pub fn decode(text: &str) -> Result<Self, SnapshotError> {
        let bytes = STANDARD.decode(text.trim())?;
        if bytes.is_empty() {
            return Err(SnapshotError::Empty);
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checkpoint({} bytes)", self.0.len())
    }
}

impl Serialize for Checkpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Checkpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Checkpoint::decode(&text).map_err(serde::de::Error::custom)
    }
}
