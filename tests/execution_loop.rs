//! Execution/resume loop driven against the in-process backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use rlm::error::{RlmError, WorkerErrorKind};
use rlm::execution::{
    HistoryRecord, MemoryHistory, RlmRuntime, RunHooks, RunRequest, SteeringSignal, ToolAborted,
    ToolCall, ToolContext, ToolDefinition, ToolOutcome, ToolResolver,
};
use rlm::worker::{LocalBackend, ResumePayload, ScriptBackend, StartPayload, WorkerReply};
use rlm::WorkerError;
use serde_json::{Value, json};
use std::sync::Arc;

/// Tools used by every scenario; records each call it receives.
#[derive(Default)]
struct TestTools {
    calls: Mutex<Vec<ToolCall>>,
}

impl TestTools {
    fn call_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|call| call.name.clone()).collect()
    }
}

#[async_trait]
impl ToolResolver for TestTools {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "echo".into(),
                description: "Echo back.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"x": {"type": "integer"}}
                }),
            },
            ToolDefinition {
                name: "upper".into(),
                description: "Uppercase text.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            },
            ToolDefinition {
                name: "fail".into(),
                description: "Report failure.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}}
                }),
            },
            ToolDefinition {
                name: "explode".into(),
                description: "Executor error.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolDefinition {
                name: "halt".into(),
                description: "Cancelled mid-call.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
        ]
    }

    async fn execute(&self, call: ToolCall, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        self.calls.lock().push(call.clone());
        match call.name.as_str() {
            "echo" => {
                let x = call.arguments.get("x").and_then(Value::as_i64).unwrap_or(0);
                Ok(ToolOutcome::value(json!({"y": x + 1})))
            }
            "upper" => {
                let text = call.arguments["text"].as_str().unwrap_or_default();
                Ok(ToolOutcome::text(text.to_uppercase()))
            }
            "fail" => {
                let message = call
                    .arguments
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(ToolOutcome::error(message))
            }
            "explode" => anyhow::bail!("executor exploded"),
            "halt" => Err(anyhow::Error::new(ToolAborted::new("user cancelled"))
                .context("while running halt")),
            other => anyhow::bail!("unexpected tool {other}"),
        }
    }
}

/// Local backend that also exposes `extra` names as external functions, so a
/// script can pause on a name the tool list does not know.
struct ExtraExternals {
    inner: LocalBackend,
    extra: Vec<String>,
}

#[async_trait]
impl ScriptBackend for ExtraExternals {
    async fn start(
        &self,
        worker_key: &str,
        mut payload: StartPayload,
    ) -> Result<WorkerReply, WorkerError> {
        payload.external_functions.extend(self.extra.iter().cloned());
        self.inner.start(worker_key, payload).await
    }

    async fn resume(
        &self,
        worker_key: &str,
        payload: ResumePayload,
    ) -> Result<WorkerReply, WorkerError> {
        self.inner.resume(worker_key, payload).await
    }

    async fn stop(&self) {}
}

fn context() -> ToolContext {
    ToolContext::new("test-worker")
}

async fn run(code: &str, tools: &TestTools, history: &MemoryHistory) -> rlm::Result<rlm::RunResult> {
    RlmRuntime::local()
        .run(
            RunRequest::new("call-1", code),
            tools,
            &context(),
            RunHooks::new(history),
        )
        .await
}

fn tool_results(history: &MemoryHistory) -> Vec<(String, String, bool)> {
    history
        .records()
        .into_iter()
        .filter_map(|record| match record {
            HistoryRecord::ToolResult(result) => {
                Some((result.tool_name, result.tool_result, result.tool_is_error))
            }
            _ => None,
        })
        .collect()
}

fn complete(history: &MemoryHistory) -> rlm::execution::CompleteRecord {
    history
        .records()
        .into_iter()
        .rev()
        .find_map(|record| match record {
            HistoryRecord::Complete(complete) => Some(complete),
            _ => None,
        })
        .expect("complete record")
}

#[tokio::test]
async fn prints_and_one_tool_call_produce_the_expected_result() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = run(
        r#"
        (print "a")
        (let r (echo :x 1))
        (print "b")
        42
        "#,
        &tools,
        &history,
    )
    .await
    .unwrap();

    assert_eq!(result.print_output, ["a", "b"]);
    assert_eq!(result.tool_call_count, 1);
    assert_eq!(result.output, "42");
    assert!(result.steering_interrupt.is_none());
    assert_eq!(tools.call_names(), ["echo"]);
    assert_eq!(
        Value::Object(tools.calls.lock()[0].arguments.clone()),
        json!({"x": 1})
    );

    assert_eq!(
        history.kinds(),
        ["rlm_start", "rlm_tool_call", "rlm_tool_result", "rlm_complete"]
    );
    assert!(history
        .records()
        .iter()
        .all(|record| record.tool_call_id() == "call-1"));

    let call = history.last_tool_call().unwrap();
    assert_eq!(call.tool_name, "echo");
    assert_eq!(call.tool_args, json!({"x": 1}));
    assert_eq!(call.print_output, ["a"]);
    assert_eq!(call.tool_call_count, 0);
    assert!(call.checkpoint().is_ok());

    assert_eq!(
        tool_results(&history),
        [("echo".to_string(), r#"{"y":2}"#.to_string(), false)]
    );
    let done = complete(&history);
    assert!(!done.is_error);
    assert_eq!(done.output, "42");
    assert_eq!(done.print_output, ["a", "b"]);
    assert_eq!(done.tool_call_count, 1);
}

#[tokio::test]
async fn start_record_holds_code_and_generated_preamble() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    run("(+ 1 1)", &tools, &history).await.unwrap();

    let start = history.last_start().unwrap();
    assert_eq!(start.code, "(+ 1 1)");
    assert!(start.preamble.contains("; (echo :x? <int>)"));
    assert!(start.preamble.contains("; (upper :text <str>)"));
}

#[tokio::test]
async fn explicit_preamble_is_used_verbatim() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = RlmRuntime::local()
        .run(
            RunRequest::new("call-2", "(len \"abc\")").with_preamble("; custom"),
            &tools,
            &context(),
            RunHooks::new(&history),
        )
        .await
        .unwrap();
    assert_eq!(result.output, "3");
    assert_eq!(history.last_start().unwrap().preamble, "; custom");
}

#[tokio::test]
async fn tool_values_flow_back_into_the_script() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = run(
        r#"
        (let r (echo :x 41))
        (print (upper (str (get r "y"))))
        (get r "y")
        "#,
        &tools,
        &history,
    )
    .await
    .unwrap();
    assert_eq!(result.output, "42");
    assert_eq!(result.print_output, ["42"]);
    assert_eq!(result.tool_call_count, 2);
    assert_eq!(tools.call_names(), ["echo", "upper"]);
}

#[tokio::test]
async fn unknown_tool_raises_inside_the_script() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let runtime = RlmRuntime::new(Arc::new(ExtraExternals {
        inner: LocalBackend::new(),
        extra: vec!["missing".into()],
    }));
    let err = runtime
        .run(
            RunRequest::new("call-3", "(print \"start\") (missing 1 :k 2)"),
            &tools,
            &context(),
            RunHooks::new(&history),
        )
        .await
        .unwrap_err();

    let RlmError::Worker(err) = err else {
        panic!("expected a worker error");
    };
    assert_eq!(err.kind, WorkerErrorKind::Runtime);
    assert!(err.message.contains("Unknown tool: missing"));
    assert!(tools.call_names().is_empty());

    assert_eq!(
        history.kinds(),
        ["rlm_start", "rlm_tool_call", "rlm_tool_result", "rlm_complete"]
    );
    let call = history.last_tool_call().unwrap();
    assert_eq!(call.tool_args, json!({"args": [1], "kwargs": {"k": 2}}));
    assert_eq!(
        tool_results(&history),
        [(
            "missing".to_string(),
            "ToolError: Unknown tool: missing".to_string(),
            true
        )]
    );
    let done = complete(&history);
    assert!(done.is_error);
    assert_eq!(done.tool_call_count, 0);
    assert_eq!(done.print_output, ["start"]);
    assert!(done.error.unwrap().contains("Unknown tool: missing"));
}

#[tokio::test]
async fn unknown_tool_can_be_handled_by_the_script() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let runtime = RlmRuntime::new(Arc::new(ExtraExternals {
        inner: LocalBackend::new(),
        extra: vec!["missing".into()],
    }));
    let result = runtime
        .run(
            RunRequest::new(
                "call-4",
                r#"(try (missing) (except :ToolError e (get e "message")))"#,
            ),
            &tools,
            &context(),
            RunHooks::new(&history),
        )
        .await
        .unwrap();
    assert_eq!(result.output, "ToolError: Unknown tool: missing");
    assert_eq!(result.tool_call_count, 0);
}

#[tokio::test]
async fn tool_failures_become_script_exceptions() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = run(
        r#"
        (let seen (list))
        (try (fail :message "nope") (except e (let seen (append seen (get e "message")))))
        (try (fail) (except e (let seen (append seen (get e "message")))))
        (try (explode) (except :ToolError e (let seen (append seen (get e "message")))))
        (try (upper) (except e (let seen (append seen (get e "message")))))
        seen
        "#,
        &tools,
        &history,
    )
    .await
    .unwrap();

    assert_eq!(
        result.output,
        "nope, Tool execution failed: fail, ToolError: executor exploded, ToolError: upper is missing required argument 'text'"
    );
    assert_eq!(result.tool_call_count, 4);
    assert_eq!(tools.call_names(), ["fail", "fail", "explode"]);

    let results = tool_results(&history);
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|(_, _, is_error)| *is_error));
    assert_eq!(results[0].1, "nope");
    assert_eq!(results[1].1, "");
    assert_eq!(results[2].1, "ToolError: executor exploded");

    let upper_call = history
        .records()
        .into_iter()
        .filter_map(|record| match record {
            HistoryRecord::ToolCall(call) if call.tool_name == "upper" => Some(call),
            _ => None,
        })
        .next()
        .unwrap();
    assert_eq!(upper_call.tool_args, json!({"args": [], "kwargs": {}}));
    assert_eq!(upper_call.tool_call_count, 3);
}

#[tokio::test]
async fn steering_stops_the_run_after_the_current_tool_call() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let steer = || Some(SteeringSignal::new("please stop", "user"));
    let result = RlmRuntime::local()
        .run(
            RunRequest::new(
                "call-5",
                r#"
                (print "one")
                (echo :x 1)
                (print "two")
                (echo :x 2)
                (echo :x 3)
                "done"
                "#,
            ),
            &tools,
            &context(),
            RunHooks::new(&history).with_steering(&steer),
        )
        .await
        .unwrap();

    assert_eq!(result.tool_call_count, 1);
    assert_eq!(tools.call_names(), ["echo"]);
    assert_eq!(result.print_output, ["one"]);
    assert_eq!(
        result.steering_interrupt,
        Some(SteeringSignal::new("please stop", "user"))
    );
    assert_eq!(
        result.output,
        "<script_result>\nScript execution interrupted by steering.\n\nPrint output so far:\none\n\n<steering_interrupt>\nMessage from user: please stop\n</steering_interrupt>\n</script_result>"
    );

    assert_eq!(
        history.kinds(),
        [
            "rlm_start",
            "rlm_tool_call",
            "rlm_tool_result",
            "rlm_steering_interrupt",
            "rlm_complete"
        ]
    );
    let done = complete(&history);
    assert!(!done.is_error);
    assert_eq!(done.output, result.output);
}

#[tokio::test]
async fn steering_poll_returning_none_lets_the_run_finish() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let steer = || -> Option<SteeringSignal> { None };
    let result = RlmRuntime::local()
        .run(
            RunRequest::new("call-6", "(echo :x 1) (echo :x 2) \"done\""),
            &tools,
            &context(),
            RunHooks::new(&history).with_steering(&steer),
        )
        .await
        .unwrap();
    assert_eq!(result.output, "done");
    assert_eq!(result.tool_call_count, 2);
}

#[tokio::test]
async fn tool_call_records_precede_their_results() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    run(
        "(for i (list 1 2 3) (echo :x i)) (upper \"a\")",
        &tools,
        &history,
    )
    .await
    .unwrap();

    let mut open: Option<String> = None;
    let mut counts = Vec::new();
    for record in history.records() {
        match record {
            HistoryRecord::ToolCall(call) => {
                assert!(open.is_none(), "tool call before previous result");
                counts.push(call.tool_call_count);
                open = Some(call.tool_name);
            }
            HistoryRecord::ToolResult(result) => {
                assert_eq!(open.take(), Some(result.tool_name));
            }
            _ => assert!(open.is_none()),
        }
    }
    assert_eq!(counts, [0, 1, 2, 3]);
}

#[tokio::test]
async fn script_errors_complete_with_an_error_record() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let err = run("(print \"x\") (write \"partial\") (raise :ValueError \"bad\")", &tools, &history)
        .await
        .unwrap_err();
    let RlmError::Worker(err) = err else {
        panic!("expected a worker error");
    };
    assert_eq!(err.kind, WorkerErrorKind::Runtime);

    let done = complete(&history);
    assert!(done.is_error);
    assert_eq!(done.print_output, ["x", "partial"]);
    assert_eq!(done.error.as_deref(), Some("runtime: ValueError: bad"));
}

#[tokio::test]
async fn syntax_errors_fail_before_any_tool_call() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let err = run("(print \"unclosed\"", &tools, &history).await.unwrap_err();
    assert!(matches!(
        err,
        RlmError::Worker(WorkerError {
            kind: WorkerErrorKind::Syntax,
            ..
        })
    ));
    assert_eq!(history.kinds(), ["rlm_start", "rlm_complete"]);
}

#[tokio::test]
async fn skip_ends_the_run_without_a_tool_call() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = run(
        "(print \"before\") (skip) (echo :x 1) \"after\"",
        &tools,
        &history,
    )
    .await
    .unwrap();

    assert!(result.skip_turn);
    assert_eq!(result.output, "Turn skipped");
    assert_eq!(result.tool_call_count, 0);
    assert_eq!(result.print_output, ["before"]);
    assert!(tools.call_names().is_empty());
    assert_eq!(history.kinds(), ["rlm_start", "rlm_complete"]);
    let done = complete(&history);
    assert!(!done.is_error);
    assert_eq!(done.output, "Turn skipped");
}

#[tokio::test]
async fn json_helpers_are_answered_by_the_host() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = run(
        r#"
        (let parsed (get (json_parse "{\"alpha\":1,\"rows\":[{\"id\":\"a\"}]}") "value"))
        (get (json_stringify parsed :pretty true) "value")
        "#,
        &tools,
        &history,
    )
    .await
    .unwrap();

    assert_eq!(
        result.output,
        "{\n  \"alpha\": 1,\n  \"rows\": [\n    {\n      \"id\": \"a\"\n    }\n  ]\n}"
    );
    assert_eq!(result.tool_call_count, 2);
    assert!(!result.skip_turn);
    assert!(tools.call_names().is_empty());
    assert_eq!(
        history.kinds(),
        [
            "rlm_start",
            "rlm_tool_call",
            "rlm_tool_result",
            "rlm_tool_call",
            "rlm_tool_result",
            "rlm_complete"
        ]
    );
    assert!(history.last_start().unwrap().preamble.contains("; (json_parse :text <str>)"));
}

#[tokio::test]
async fn invalid_json_raises_a_tool_error() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let result = run(
        r#"(try (json_parse "{oops") (except :ToolError e (get e "message")))"#,
        &tools,
        &history,
    )
    .await
    .unwrap();
    assert!(result.output.starts_with("ToolError: json_parse: invalid JSON"));
    assert!(tool_results(&history)[0].2);
}

#[tokio::test]
async fn aborted_tool_calls_abort_the_run() {
    let tools = TestTools::default();
    let history = MemoryHistory::new();
    let err = run(
        "(try (halt) (except e \"swallowed\"))",
        &tools,
        &history,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RlmError::Aborted(ref reason) if reason == "user cancelled"));
    assert_eq!(tools.call_names(), ["halt"]);
    assert_eq!(history.kinds(), ["rlm_start", "rlm_tool_call"]);
}
