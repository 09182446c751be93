//! Host-side execution of scripts that call back into tools.
//!
//! [`RlmRuntime::run`] starts a script on a [`ScriptBackend`], answers every
//! paused external call through a [`ToolResolver`], and writes a history
//! record before and after each call. Those records carry the checkpoint the
//! run was paused at, so [`RlmRuntime::recover`] can continue a run whose host
//! died mid-call: the interrupted call is answered with a restart exception and
//! the loop carries on as if nothing happened.

/// Script arguments to tool arguments and back.
pub mod convert;
mod execute;
/// Value rendering.
pub mod format;
/// History records and sinks.
pub mod history;
/// Tool preamble text.
pub mod preamble;
/// Print line capture.
pub mod print;
/// Functions answered by the host without the tool executor.
pub mod runtime_tools;
/// Tool, context and steering interfaces.
pub mod tools;

pub use convert::{args_convert, result_convert};
pub use format::format_value;
pub use history::{
    CompleteRecord, HistoryRecord, HistorySink, MemoryHistory, StartRecord,
    SteeringInterruptRecord, ToolCallRecord, ToolResultRecord,
};
pub use preamble::preamble_build;
pub use print::PrintCapture;
pub use runtime_tools::{SKIP_FUNCTION, SKIP_OUTPUT, with_runtime_tools};
pub use tools::{
    SteeringSignal, ToolAborted, ToolCall, ToolContext, ToolDefinition, ToolOutcome,
    ToolResolver,
};

use crate::config::RlmConfig;
use crate::error::Result;
use crate::progress::{Limits, ResumeInstruction};
use crate::worker::{LocalBackend, ResumePayload, ScriptBackend, StartPayload, WorkerPool};
use execute::{RunLoop, script_join};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Steering poll checked once after every completed tool call.
pub type SteeringPoll = dyn Fn() -> Option<SteeringSignal> + Send + Sync;

/// A script to run on behalf of an outer tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Id of the outer tool call; stamped on every history record.
    pub call_id: String,
    /// Script source.
    pub code: String,
    /// Preamble to prepend; built from the tool list when `None`.
    pub preamble: Option<String>,
}

impl RunRequest {
    /// Request with a generated preamble.
    pub fn new(call_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            code: code.into(),
            preamble: None,
        }
    }

    /// Use `preamble` instead of generating one.
    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }
}

/// Per-run callbacks.
#[derive(Clone, Copy)]
pub struct RunHooks<'a> {
    /// Where history records go.
    pub history: &'a dyn HistorySink,
    /// Optional steering poll.
    pub steering: Option<&'a SteeringPoll>,
}

impl<'a> RunHooks<'a> {
    /// Hooks that only record history.
    pub fn new(history: &'a dyn HistorySink) -> Self {
        Self {
            history,
            steering: None,
        }
    }

    /// Poll `steering` after every tool call.
    pub fn with_steering(mut self, steering: &'a SteeringPoll) -> Self {
        self.steering = Some(steering);
        self
    }
}

/// Outcome of a run that finished, was skipped, or was steered away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Rendered program output, or the steering notice.
    pub output: String,
    /// Every printed line.
    pub print_output: Vec<String>,
    /// Tool calls executed, including any before a recovery.
    pub tool_call_count: usize,
    /// The steering message that cut the run short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steering_interrupt: Option<SteeringSignal>,
    /// The script called `skip`; the output is [`SKIP_OUTPUT`].
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_turn: bool,
}

/// Runs and recovers scripts against a backend.
#[derive(Clone)]
pub struct RlmRuntime {
    backend: Arc<dyn ScriptBackend>,
    limits: Limits,
}

impl RlmRuntime {
    /// Runtime over `backend` with default limits.
    pub fn new(backend: Arc<dyn ScriptBackend>) -> Self {
        Self {
            backend,
            limits: Limits::default(),
        }
    }

    /// Override the per-step limits sent with every start.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Runtime over a dedicated worker pool built from `config`.
    pub fn from_config(config: &RlmConfig) -> Self {
        Self::new(Arc::new(WorkerPool::from_config(config))).with_limits(config.limits)
    }

    /// Runtime over the process-wide worker pool.
    pub fn shared() -> Self {
        Self::new(WorkerPool::shared())
    }

    /// Runtime that interprets scripts in-process.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalBackend::new()))
    }

    /// Limits sent with every start.
    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Run `request` to completion, steering interrupt, or failure.
    pub async fn run(
        &self,
        request: RunRequest,
        tools: &dyn ToolResolver,
        context: &ToolContext,
        hooks: RunHooks<'_>,
    ) -> Result<RunResult> {
        let definitions = with_runtime_tools(tools.list_tools());
        let external_functions = definitions.iter().map(|tool| tool.name.clone()).collect();
        let preamble = request
            .preamble
            .unwrap_or_else(|| preamble_build(&definitions));
        let script = script_join(&preamble, &request.code);

        let run_loop = RunLoop::new(
            self.backend.as_ref(),
            tools,
            context,
            hooks,
            request.call_id,
            definitions,
        );
        run_loop
            .record(HistoryRecord::Start(StartRecord {
                at: history::now_millis(),
                tool_call_id: run_loop.call_id().to_string(),
                code: request.code,
                preamble,
            }))
            .await?;

        let first = self
            .backend
            .start(
                &context.worker_key,
                StartPayload {
                    code: script,
                    external_functions,
                    limits: self.limits,
                },
            )
            .await;
        run_loop.drive(first).await
    }

    /// Continue a run from its last tool-call record after a host restart.
    ///
    /// The call that was in flight is answered with a `RuntimeError`
    /// ("Process was restarted") so the script can decide whether to retry.
    /// Recovering the same record twice replays the same steps.
    pub async fn recover(
        &self,
        last_tool_call: &ToolCallRecord,
        start: &StartRecord,
        tools: &dyn ToolResolver,
        context: &ToolContext,
        hooks: RunHooks<'_>,
    ) -> Result<RunResult> {
        let checkpoint = last_tool_call.checkpoint()?;
        let run_loop = RunLoop::new(
            self.backend.as_ref(),
            tools,
            context,
            hooks,
            start.tool_call_id.clone(),
            with_runtime_tools(tools.list_tools()),
        )
        .seeded(
            last_tool_call.print_output.clone(),
            last_tool_call.tool_call_count,
        );
        let first = self
            .backend
            .resume(
                &context.worker_key,
                ResumePayload {
                    checkpoint,
                    instruction: ResumeInstruction::restarted(),
                },
            )
            .await;
        run_loop.drive(first).await
    }

    /// Stop the backend and every worker it owns.
    pub async fn shutdown(&self) {
        self.backend.stop().await;
    }
}

impl std::fmt::Debug for RlmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RlmRuntime")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
