//! Recovering runs from their last tool-call record after a simulated host crash.

use async_trait::async_trait;
use parking_lot::Mutex;
use rlm::error::RlmError;
use rlm::execution::{
    HistoryRecord, HistorySink, MemoryHistory, RlmRuntime, RunHooks, RunRequest, StartRecord,
    ToolCall, ToolCallRecord, ToolContext, ToolDefinition, ToolOutcome, ToolResolver,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingEcho {
    calls: AtomicUsize,
}

#[async_trait]
impl ToolResolver for CountingEcho {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo back.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"x": {"type": "integer"}}
            }),
        }]
    }

    async fn execute(&self, call: ToolCall, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutcome::value(json!({"echo": call.arguments})))
    }
}

/// Persists records like [`MemoryHistory`] but reports a failure right after
/// persisting the tool call numbered `crash_at`, as if the host died there.
struct CrashingHistory {
    records: Mutex<Vec<HistoryRecord>>,
    crash_at: usize,
}

impl CrashingHistory {
    fn new(crash_at: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            crash_at,
        }
    }

    fn start(&self) -> StartRecord {
        self.records
            .lock()
            .iter()
            .find_map(|record| match record {
                HistoryRecord::Start(start) => Some(start.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn last_tool_call(&self) -> ToolCallRecord {
        self.records
            .lock()
            .iter()
            .rev()
            .find_map(|record| match record {
                HistoryRecord::ToolCall(call) => Some(call.clone()),
                _ => None,
            })
            .unwrap()
    }
}

#[async_trait]
impl HistorySink for CrashingHistory {
    async fn append(&self, record: HistoryRecord) -> anyhow::Result<()> {
        let crash = matches!(
            &record,
            HistoryRecord::ToolCall(call) if call.tool_call_count == self.crash_at
        );
        self.records.lock().push(record);
        if crash {
            anyhow::bail!("host crashed");
        }
        Ok(())
    }
}

const RETRYING_SCRIPT: &str = r#"
(print "before")
(let first (echo :x 1))
(print "between")
(let second
  (try
    (echo :x 2)
    (except e
      (print (+ "retrying after " (get e "message")))
      (echo :x 3))))
(list (get first "echo") (get second "echo"))
"#;

async fn crash_during_second_call(tools: &CountingEcho) -> CrashingHistory {
    let history = CrashingHistory::new(1);
    let err = RlmRuntime::local()
        .run(
            RunRequest::new("outer-1", RETRYING_SCRIPT),
            tools,
            &ToolContext::new("w"),
            RunHooks::new(&history),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::History(ref message) if message == "host crashed"));
    history
}

#[tokio::test]
async fn history_failure_abandons_the_run_before_the_tool_executes() {
    let tools = CountingEcho::default();
    let history = crash_during_second_call(&tools).await;

    assert_eq!(tools.calls.load(Ordering::SeqCst), 1);
    let call = history.last_tool_call();
    assert_eq!(call.tool_call_count, 1);
    assert_eq!(call.tool_args, json!({"x": 2}));
    assert_eq!(call.print_output, ["before", "between"]);
    assert!(
        !history
            .records
            .lock()
            .iter()
            .any(|record| matches!(record, HistoryRecord::Complete(_)))
    );
}

#[tokio::test]
async fn recovery_raises_restart_at_the_interrupted_call() {
    let tools = CountingEcho::default();
    let crashed = crash_during_second_call(&tools).await;

    let history = MemoryHistory::new();
    let result = RlmRuntime::local()
        .recover(
            &crashed.last_tool_call(),
            &crashed.start(),
            &tools,
            &ToolContext::new("w"),
            RunHooks::new(&history),
        )
        .await
        .unwrap();

    assert_eq!(
        result.print_output,
        ["before", "between", "retrying after Process was restarted"]
    );
    assert_eq!(result.output, r#"{"x":1}, {"x":3}"#);
    assert_eq!(result.tool_call_count, 2);
    assert_eq!(tools.calls.load(Ordering::SeqCst), 2);

    assert_eq!(
        history.kinds(),
        ["rlm_tool_call", "rlm_tool_result", "rlm_complete"]
    );
    let retry = history.last_tool_call().unwrap();
    assert_eq!(retry.tool_call_id, "outer-1");
    assert_eq!(retry.tool_args, json!({"x": 3}));
    assert_eq!(retry.tool_call_count, 1);
}

#[tokio::test]
async fn recovering_the_same_record_twice_gives_the_same_result() {
    let tools = CountingEcho::default();
    let crashed = crash_during_second_call(&tools).await;
    let call = crashed.last_tool_call();
    let start = crashed.start();
    let runtime = RlmRuntime::local();

    let mut results = Vec::new();
    for _ in 0..2 {
        let history = MemoryHistory::new();
        let result = runtime
            .recover(
                &call,
                &start,
                &tools,
                &ToolContext::new("w"),
                RunHooks::new(&history),
            )
            .await
            .unwrap();
        results.push((result, history.kinds()));
    }
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn unhandled_restart_fails_the_recovered_run() {
    let tools = CountingEcho::default();
    let history = CrashingHistory::new(0);
    RlmRuntime::local()
        .run(
            RunRequest::new("outer-2", "(print \"x\") (echo :x 1)"),
            &tools,
            &ToolContext::new("w"),
            RunHooks::new(&history),
        )
        .await
        .unwrap_err();

    let recovered = MemoryHistory::new();
    let err = RlmRuntime::local()
        .recover(
            &history.last_tool_call(),
            &history.start(),
            &tools,
            &ToolContext::new("w"),
            RunHooks::new(&recovered),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Process was restarted"));
    match recovered.records().last() {
        Some(HistoryRecord::Complete(done)) => {
            assert!(done.is_error);
            assert_eq!(done.print_output, ["x"]);
            assert_eq!(done.tool_call_count, 0);
        }
        other => panic!("expected a complete record, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_checkpoints_are_rejected() {
    let tools = CountingEcho::default();
    let history = CrashingHistory::new(0);
    RlmRuntime::local()
        .run(
            RunRequest::new("outer-3", "(echo :x 1)"),
            &tools,
            &ToolContext::new("w"),
            RunHooks::new(&history),
        )
        .await
        .unwrap_err();

    let mut call = history.last_tool_call();
    call.checkpoint = "%%%".into();
    let err = RlmRuntime::local()
        .recover(
            &call,
            &history.start(),
            &tools,
            &ToolContext::new("w"),
            RunHooks::new(&MemoryHistory::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::Snapshot(_)));
}
