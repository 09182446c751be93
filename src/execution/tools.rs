//! Interfaces to the host's tool layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A callable tool as advertised to scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Name scripts call the tool by.
    pub name: String,
    /// Short human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the argument object.
    #[serde(default)]
    pub parameters: Value,
}

/// A concrete invocation handed to the tool executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id of this invocation.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Converted argument object.
    pub arguments: Map<String, Value>,
}

/// What a tool produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Text shown to the model.
    pub text: String,
    /// Whether the tool reported failure.
    pub is_error: bool,
    /// Structured value returned to the script, if any.
    pub value: Option<Value>,
}

impl ToolOutcome {
    /// Successful text result.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Successful structured result; the text is its compact JSON.
    pub fn value(value: Value) -> Self {
        Self {
            text: value.to_string(),
            is_error: false,
            value: Some(value),
        }
    }

    /// Failed result.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
            value: None,
        }
    }
}

/// Per-run context passed through to every tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContext {
    /// Key selecting the worker process for this run.
    pub worker_key: String,
    /// Caller metadata, opaque to this crate.
    #[serde(default)]
    pub metadata: Value,
}

impl ToolContext {
    /// Context for `worker_key` with no metadata.
    pub fn new(worker_key: impl Into<String>) -> Self {
        Self {
            worker_key: worker_key.into(),
            metadata: Value::Null,
        }
    }
}

/// Lists and executes host tools.
#[async_trait]
pub trait ToolResolver: Send + Sync {
    /// Tools callable from scripts.
    fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Execute one call. An `Err` is reported to the script as a `ToolError`,
    /// unless its chain holds a [`ToolAborted`], which aborts the whole run.
    async fn execute(&self, call: ToolCall, context: &ToolContext) -> anyhow::Result<ToolOutcome>;
}

/// Executor error that cancels the run instead of raising inside the script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tool call aborted: {reason}")]
pub struct ToolAborted {
    /// Why the call was cancelled.
    pub reason: String,
}

impl ToolAborted {
    /// Abort with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Message that interrupts a run between tool calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SteeringSignal {
    /// Message text.
    pub text: String,
    /// Who sent it; rendered as `system` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl SteeringSignal {
    /// Steering message with an origin.
    pub fn new(text: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: Some(origin.into()),
        }
    }
}
