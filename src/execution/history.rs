//! Durable history records written by the execution loop.
//!
//! The sink is the caller's persistence layer; records arrive in event order
//! and every write is awaited before the loop moves on.

use super::tools::SteeringSignal;
use crate::progress::{Checkpoint, SnapshotError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A fresh run began.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRecord {
    /// Unix millis.
    pub at: i64,
    /// Outer tool call that owns the run.
    pub tool_call_id: String,
    /// Script source as submitted.
    pub code: String,
    /// Preamble shown to the script author.
    pub preamble: String,
}

/// A tool is about to be invoked. Written before the invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Unix millis.
    pub at: i64,
    /// Outer tool call that owns the run.
    pub tool_call_id: String,
    /// Base64 checkpoint captured at the call.
    pub checkpoint: String,
    /// Lines printed before the call.
    pub print_output: Vec<String>,
    /// Tool calls completed before this one.
    pub tool_call_count: usize,
    /// Tool name.
    pub tool_name: String,
    /// Converted arguments, or the raw `{args, kwargs}` if conversion failed.
    pub tool_args: Value,
}

impl ToolCallRecord {
    /// Decode the stored checkpoint.
    pub fn checkpoint(&self) -> Result<Checkpoint, SnapshotError> {
        Checkpoint::decode(&self.checkpoint)
    }
}

/// A tool invocation finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultRecord {
    /// Unix millis.
    pub at: i64,
    /// Outer tool call that owns the run.
    pub tool_call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Rendered result text.
    pub tool_result: String,
    /// Whether the result is an error.
    pub tool_is_error: bool,
}

/// The run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRecord {
    /// Unix millis.
    pub at: i64,
    /// Outer tool call that owns the run.
    pub tool_call_id: String,
    /// Rendered output.
    pub output: String,
    /// Every printed line.
    pub print_output: Vec<String>,
    /// Tool calls executed.
    pub tool_call_count: usize,
    /// Whether the run failed.
    pub is_error: bool,
    /// Failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The run was interrupted by steering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringInterruptRecord {
    /// Unix millis.
    pub at: i64,
    /// Outer tool call that owns the run.
    pub tool_call_id: String,
    /// Interrupted output text.
    pub output: String,
    /// Lines printed before the interrupt.
    pub print_output: Vec<String>,
    /// Steering message.
    pub steering: SteeringSignal,
}

/// One history entry, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HistoryRecord {
    /// See [`StartRecord`].
    #[serde(rename = "rlm_start")]
    Start(StartRecord),
    /// See [`ToolCallRecord`].
    #[serde(rename = "rlm_tool_call")]
    ToolCall(ToolCallRecord),
    /// See [`ToolResultRecord`].
    #[serde(rename = "rlm_tool_result")]
    ToolResult(ToolResultRecord),
    /// See [`CompleteRecord`].
    #[serde(rename = "rlm_complete")]
    Complete(CompleteRecord),
    /// See [`SteeringInterruptRecord`].
    #[serde(rename = "rlm_steering_interrupt")]
    SteeringInterrupt(SteeringInterruptRecord),
}

impl HistoryRecord {
    /// Wire tag of this record.
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryRecord::Start(_) => "rlm_start",
            HistoryRecord::ToolCall(_) => "rlm_tool_call",
            HistoryRecord::ToolResult(_) => "rlm_tool_result",
            HistoryRecord::Complete(_) => "rlm_complete",
            HistoryRecord::SteeringInterrupt(_) => "rlm_steering_interrupt",
        }
    }

    /// Outer tool call that owns the record.
    pub fn tool_call_id(&self) -> &str {
        match self {
            HistoryRecord::Start(record) => &record.tool_call_id,
            HistoryRecord::ToolCall(record) => &record.tool_call_id,
            HistoryRecord::ToolResult(record) => &record.tool_call_id,
            HistoryRecord::Complete(record) => &record.tool_call_id,
            HistoryRecord::SteeringInterrupt(record) => &record.tool_call_id,
        }
    }
}

/// Persists history records.
#[async_trait]
pub trait HistorySink: Send + Sync {
    /// Append one record. A failure abandons the run.
    async fn append(&self, record: HistoryRecord) -> anyhow::Result<()>;
}

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record appended so far.
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    /// Record tags in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.records.lock().iter().map(HistoryRecord::kind).collect()
    }

    /// Most recent start record.
    pub fn last_start(&self) -> Option<StartRecord> {
        self.records.lock().iter().rev().find_map(|record| match record {
            HistoryRecord::Start(start) => Some(start.clone()),
            _ => None,
        })
    }

    /// Most recent tool-call record.
    pub fn last_tool_call(&self) -> Option<ToolCallRecord> {
        self.records.lock().iter().rev().find_map(|record| match record {
            HistoryRecord::ToolCall(call) => Some(call.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn append(&self, record: HistoryRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_are_tagged_by_type() {
        let record = HistoryRecord::ToolResult(ToolResultRecord {
            at: 5,
            tool_call_id: "call-1".into(),
            tool_name: "echo".into(),
            tool_result: "{\"y\":2}".into(),
            tool_is_error: false,
        });
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "rlm_tool_result",
                "at": 5,
                "tool_call_id": "call-1",
                "tool_name": "echo",
                "tool_result": "{\"y\":2}",
                "tool_is_error": false
            })
        );
        let back: HistoryRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.kind(), "rlm_tool_result");
    }

    #[tokio::test]
    async fn memory_history_tracks_latest_records() {
        let history = MemoryHistory::new();
        history
            .append(HistoryRecord::Start(StartRecord {
                at: now_millis(),
                tool_call_id: "c".into(),
                code: "1".into(),
                preamble: String::new(),
            }))
            .await
            .unwrap();
        assert_eq!(history.kinds(), ["rlm_start"]);
        assert!(history.last_start().is_some());
        assert!(history.last_tool_call().is_none());
    }
}
