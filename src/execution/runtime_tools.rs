//! Functions the host answers itself instead of handing them to the tool
//! executor.

use super::tools::ToolDefinition;
use anyhow::Context as _;
use serde_json::{Map, Value, json};

/// Ends the run at once with [`SKIP_OUTPUT`]; never recorded as a tool call.
pub const SKIP_FUNCTION: &str = "skip";
/// Output of a run ended by [`SKIP_FUNCTION`].
pub const SKIP_OUTPUT: &str = "Turn skipped";

const JSON_PARSE: &str = "json_parse";
const JSON_STRINGIFY: &str = "json_stringify";

fn runtime_definitions() -> [ToolDefinition; 3] {
    [
        ToolDefinition {
            name: SKIP_FUNCTION.into(),
            description: "End this turn without producing a result.".into(),
            parameters: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: JSON_PARSE.into(),
            description: "Parse JSON text. Returns {\"value\": parsed}.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        },
        ToolDefinition {
            name: JSON_STRINGIFY.into(),
            description: "Serialize a value to JSON text. Returns {\"value\": text}.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "value": {},
                    "pretty": {"type": "boolean"}
                },
                "required": ["value"]
            }),
        },
    ]
}

/// The host's tools plus every runtime function they do not already name.
pub fn with_runtime_tools(mut tools: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    for definition in runtime_definitions() {
        if !tools.iter().any(|tool| tool.name == definition.name) {
            tools.push(definition);
        }
    }
    tools
}

/// Answer a runtime-handled call, or `None` when `name` belongs to the executor.
pub fn runtime_tool_execute(
    name: &str,
    arguments: &Map<String, Value>,
) -> Option<anyhow::Result<Value>> {
    match name {
        JSON_PARSE => Some(json_parse(arguments)),
        JSON_STRINGIFY => Some(json_stringify(arguments)),
        _ => None,
    }
}

fn json_parse(arguments: &Map<String, Value>) -> anyhow::Result<Value> {
    let text = arguments
        .get("text")
        .and_then(Value::as_str)
        .context("json_parse expects a string")?;
    let value: Value =
        serde_json::from_str(text).with_context(|| format!("{JSON_PARSE}: invalid JSON"))?;
    Ok(json!({ "value": value }))
}

fn json_stringify(arguments: &Map<String, Value>) -> anyhow::Result<Value> {
    let value = arguments.get("value").unwrap_or(&Value::Null);
    let pretty = arguments
        .get("pretty")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(json!({ "value": text }))
}
