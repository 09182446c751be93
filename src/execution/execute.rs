//! The execution/resume loop shared by fresh and recovered runs.

use super::convert::{args_convert, result_convert};
use super::format::format_value;
use super::history::{
    CompleteRecord, HistoryRecord, SteeringInterruptRecord, ToolCallRecord, ToolResultRecord,
    now_millis,
};
use super::print::PrintCapture;
use super::runtime_tools::{SKIP_FUNCTION, SKIP_OUTPUT, runtime_tool_execute};
use super::tools::{
    SteeringSignal, ToolAborted, ToolCall, ToolContext, ToolDefinition, ToolResolver,
};
use super::{RunHooks, RunResult};
use crate::error::{Result, RlmError, WorkerError};
use crate::progress::{Checkpoint, Progress, ResumeInstruction};
use crate::worker::{ResumePayload, ScriptBackend, WorkerReply};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exception kind raised inside the script for every tool failure.
const TOOL_EXCEPTION_KIND: &str = "RuntimeError";

enum CallOutcome {
    Resume(ResumeInstruction),
    Ended(RunResult),
}

/// State of one run between backend steps.
pub(super) struct RunLoop<'a> {
    backend: &'a dyn ScriptBackend,
    tools: &'a dyn ToolResolver,
    context: &'a ToolContext,
    hooks: RunHooks<'a>,
    call_id: String,
    definitions: Vec<ToolDefinition>,
    prints: PrintCapture,
    tool_call_count: usize,
}

impl<'a> RunLoop<'a> {
    pub(super) fn new(
        backend: &'a dyn ScriptBackend,
        tools: &'a dyn ToolResolver,
        context: &'a ToolContext,
        hooks: RunHooks<'a>,
        call_id: String,
        definitions: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            backend,
            tools,
            context,
            hooks,
            call_id,
            definitions,
            prints: PrintCapture::new(),
            tool_call_count: 0,
        }
    }

    /// Continue from the print lines and call count stored in a tool-call record.
    pub(super) fn seeded(mut self, print_output: Vec<String>, tool_call_count: usize) -> Self {
        self.prints = PrintCapture::seeded(print_output);
        self.tool_call_count = tool_call_count;
        self
    }

    pub(super) fn call_id(&self) -> &str {
        &self.call_id
    }

    pub(super) async fn record(&self, record: HistoryRecord) -> Result<()> {
        self.hooks
            .history
            .append(record)
            .await
            .map_err(|err| RlmError::History(err.to_string()))
    }

    /// Drive the run from its first backend reply to a terminal result.
    pub(super) async fn drive(
        mut self,
        first: std::result::Result<WorkerReply, WorkerError>,
    ) -> Result<RunResult> {
        let mut step = first;
        loop {
            let reply = match step {
                Ok(reply) => reply,
                Err(err) => return self.fail(err).await,
            };
            self.prints.extend(&reply.print_output);
            let (function_name, args, kwargs, checkpoint) = match reply.progress {
                Progress::Finished { output } => return self.finish(&output).await,
                Progress::Paused {
                    function_name,
                    args,
                    kwargs,
                    checkpoint,
                } => (function_name, args, kwargs, checkpoint),
            };
            let instruction = match self
                .call(&function_name, &args, &kwargs, &checkpoint)
                .await?
            {
                CallOutcome::Resume(instruction) => instruction,
                CallOutcome::Ended(result) => return Ok(result),
            };
            step = self
                .backend
                .resume(
                    &self.context.worker_key,
                    ResumePayload {
                        checkpoint,
                        instruction,
                    },
                )
                .await;
        }
    }

    async fn call(
        &mut self,
        function_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        checkpoint: &Checkpoint,
    ) -> Result<CallOutcome> {
        self.prints.flush_trailing();
        if function_name == SKIP_FUNCTION {
            return self.skip().await.map(CallOutcome::Ended);
        }
        let raw_args = json!({ "args": args, "kwargs": kwargs });
        let Some(tool) = self
            .definitions
            .iter()
            .find(|tool| tool.name == function_name)
            .cloned()
        else {
            return self.call_unknown(function_name, raw_args, checkpoint).await;
        };

        let converted = args_convert(args, kwargs, &tool);
        let tool_args = match &converted {
            Ok(arguments) => Value::Object(arguments.clone()),
            Err(_) => raw_args,
        };
        self.record(HistoryRecord::ToolCall(self.tool_call_record(
            &tool.name,
            tool_args,
            checkpoint,
        )))
        .await?;
        self.tool_call_count += 1;

        let (instruction, text, is_error) = match converted {
            Err(err) => tool_error(err.to_string()),
            Ok(arguments) => self.execute(&tool, arguments).await?,
        };
        debug!(
            call_id = %self.call_id,
            tool = %tool.name,
            is_error,
            "tool call finished"
        );
        self.record(HistoryRecord::ToolResult(ToolResultRecord {
            at: now_millis(),
            tool_call_id: self.call_id.clone(),
            tool_name: tool.name.clone(),
            tool_result: text,
            tool_is_error: is_error,
        }))
        .await?;

        if let Some(signal) = self.hooks.steering.and_then(|poll| poll()) {
            return self.interrupt(signal).await.map(CallOutcome::Ended);
        }
        Ok(CallOutcome::Resume(instruction))
    }

    async fn execute(
        &self,
        tool: &ToolDefinition,
        arguments: Map<String, Value>,
    ) -> Result<(ResumeInstruction, String, bool)> {
        if let Some(result) = runtime_tool_execute(&tool.name, &arguments) {
            return Ok(match result {
                Ok(value) => {
                    let text = format_value(&value);
                    (ResumeInstruction::ReturnValue(value), text, false)
                }
                Err(err) => tool_error(format!("{err:#}")),
            });
        }
        let call = ToolCall {
            id: Uuid::new_v4().to_string(),
            name: tool.name.clone(),
            arguments,
        };
        match self.tools.execute(call, self.context).await {
            Ok(outcome) => {
                let value = result_convert(&outcome);
                let text = format_value(&value);
                if !outcome.is_error {
                    return Ok((ResumeInstruction::ReturnValue(value), text, false));
                }
                let message = if text.trim().is_empty() {
                    format!("Tool execution failed: {}", tool.name)
                } else {
                    text.clone()
                };
                Ok((
                    ResumeInstruction::exception(TOOL_EXCEPTION_KIND, message),
                    text,
                    true,
                ))
            }
            Err(err) => match err.chain().find_map(|cause| cause.downcast_ref::<ToolAborted>()) {
                Some(aborted) => {
                    info!(call_id = %self.call_id, tool = %tool.name, "run aborted by tool");
                    Err(RlmError::Aborted(aborted.reason.clone()))
                }
                None => Ok(tool_error(err.to_string())),
            },
        }
    }

    async fn call_unknown(
        &mut self,
        function_name: &str,
        raw_args: Value,
        checkpoint: &Checkpoint,
    ) -> Result<CallOutcome> {
        let message = format!("ToolError: Unknown tool: {function_name}");
        debug!(call_id = %self.call_id, function_name, "unknown tool");
        self.record(HistoryRecord::ToolCall(self.tool_call_record(
            function_name,
            raw_args,
            checkpoint,
        )))
        .await?;
        self.record(HistoryRecord::ToolResult(ToolResultRecord {
            at: now_millis(),
            tool_call_id: self.call_id.clone(),
            tool_name: function_name.to_string(),
            tool_result: message.clone(),
            tool_is_error: true,
        }))
        .await?;
        Ok(CallOutcome::Resume(ResumeInstruction::exception(
            TOOL_EXCEPTION_KIND,
            message,
        )))
    }

    fn tool_call_record(
        &self,
        tool_name: &str,
        tool_args: Value,
        checkpoint: &Checkpoint,
    ) -> ToolCallRecord {
        ToolCallRecord {
            at: now_millis(),
            tool_call_id: self.call_id.clone(),
            checkpoint: checkpoint.encode(),
            print_output: self.prints.lines().to_vec(),
            tool_call_count: self.tool_call_count,
            tool_name: tool_name.to_string(),
            tool_args,
        }
    }

    async fn interrupt(&mut self, signal: SteeringSignal) -> Result<RunResult> {
        self.prints.flush_trailing();
        let output = steering_output(self.prints.lines(), &signal);
        info!(
            call_id = %self.call_id,
            tool_call_count = self.tool_call_count,
            "run interrupted by steering"
        );
        self.record(HistoryRecord::SteeringInterrupt(SteeringInterruptRecord {
            at: now_millis(),
            tool_call_id: self.call_id.clone(),
            output: output.clone(),
            print_output: self.prints.lines().to_vec(),
            steering: signal.clone(),
        }))
        .await?;
        self.record(HistoryRecord::Complete(self.complete_record(&output, None)))
            .await?;
        Ok(RunResult {
            output,
            print_output: self.prints.lines().to_vec(),
            tool_call_count: self.tool_call_count,
            steering_interrupt: Some(signal),
            skip_turn: false,
        })
    }

    async fn skip(&mut self) -> Result<RunResult> {
        debug!(call_id = %self.call_id, "run skipped");
        self.record(HistoryRecord::Complete(self.complete_record(SKIP_OUTPUT, None)))
            .await?;
        Ok(RunResult {
            output: SKIP_OUTPUT.to_string(),
            print_output: self.prints.lines().to_vec(),
            tool_call_count: self.tool_call_count,
            steering_interrupt: None,
            skip_turn: true,
        })
    }

    async fn finish(&mut self, output: &Value) -> Result<RunResult> {
        self.prints.flush_trailing();
        let output = format_value(output);
        self.record(HistoryRecord::Complete(self.complete_record(&output, None)))
            .await?;
        debug!(
            call_id = %self.call_id,
            tool_call_count = self.tool_call_count,
            "run finished"
        );
        Ok(RunResult {
            output,
            print_output: self.prints.lines().to_vec(),
            tool_call_count: self.tool_call_count,
            steering_interrupt: None,
            skip_turn: false,
        })
    }

    async fn fail(&mut self, err: WorkerError) -> Result<RunResult> {
        self.prints.extend(&err.print_output);
        self.prints.flush_trailing();
        warn!(call_id = %self.call_id, error = %err, "run failed");
        self.record(HistoryRecord::Complete(
            self.complete_record("", Some(err.to_string())),
        ))
        .await?;
        Err(RlmError::Worker(err))
    }

    fn complete_record(&self, output: &str, error: Option<String>) -> CompleteRecord {
        CompleteRecord {
            at: now_millis(),
            tool_call_id: self.call_id.clone(),
            output: output.to_string(),
            print_output: self.prints.lines().to_vec(),
            tool_call_count: self.tool_call_count,
            is_error: error.is_some(),
            error,
        }
    }
}

fn tool_error(message: String) -> (ResumeInstruction, String, bool) {
    let text = format!("ToolError: {message}");
    (
        ResumeInstruction::exception(TOOL_EXCEPTION_KIND, text.clone()),
        text,
        true,
    )
}

/// Output text of a run cut short by steering.
pub(super) fn steering_output(lines: &[String], signal: &SteeringSignal) -> String {
    let so_far = if lines.is_empty() {
        String::new()
    } else {
        format!("Print output so far:\n{}\n\n", lines.join("\n"))
    };
    let origin = signal.origin.as_deref().unwrap_or("system");
    format!(
        "<script_result>\nScript execution interrupted by steering.\n\n{so_far}<steering_interrupt>\nMessage from {origin}: {}\n</steering_interrupt>\n</script_result>",
        signal.text
    )
}

/// Script submitted to the backend: the preamble followed by the user code.
pub(super) fn script_join(preamble: &str, code: &str) -> String {
    [preamble.trim(), code]
        .into_iter()
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
