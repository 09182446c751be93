//! RLM – resumable, process-isolated script execution
//!
//! This crate runs untrusted scripts that call back into host tools:
//! - Scripts execute in per-key worker processes spoken to over NDJSON
//! - Every external call suspends the script behind an opaque checkpoint
//! - Tool calls are journaled to history before they run, so a restarted host
//!   can resume from the last checkpoint
//! - A steering poll can cut a run short between tool calls

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Configuration file and environment overrides
pub mod config;
/// Error types
pub mod error;
/// Execution/resume loop, history records and tool interfaces
pub mod execution;
/// Sandboxed script interpreter
pub mod interpreter;
/// Progress, checkpoints and other values shared by every layer
pub mod progress;
/// Worker processes, wire protocol and backends
pub mod worker;

// Re-export key types for convenience
pub use config::RlmConfig;
pub use error::{Result, RlmError, WorkerError, WorkerErrorKind};
pub use execution::{
    HistoryRecord, HistorySink, MemoryHistory, RlmRuntime, RunHooks, RunRequest, RunResult,
    SteeringSignal, ToolContext, ToolDefinition, ToolOutcome, ToolResolver,
};
pub use progress::{Checkpoint, Limits, Progress, ResumeInstruction};
pub use worker::{ScriptBackend, WorkerPool};

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
