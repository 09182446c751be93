//! Conversion between script call arguments and tool argument objects.

use super::tools::{ToolDefinition, ToolOutcome};
use crate::error::ConvertError;
use serde_json::{Map, Value};

/// Build a tool's argument object from a paused call's positional and keyword
/// arguments, checked against the tool's JSON parameter schema.
pub fn args_convert(
    args: &[Value],
    kwargs: &Map<String, Value>,
    tool: &ToolDefinition,
) -> Result<Map<String, Value>, ConvertError> {
    let schema = tool.parameters.as_object();
    let empty = Map::new();
    let properties = schema
        .and_then(|schema| schema.get("properties"))
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let required: Vec<&str> = schema
        .and_then(|schema| schema.get("required"))
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let closed = schema
        .and_then(|schema| schema.get("additionalProperties"))
        .and_then(Value::as_bool)
        == Some(false);

    if args.len() > properties.len() {
        return Err(ConvertError::TooManyPositional {
            tool: tool.name.clone(),
            max: properties.len(),
            given: args.len(),
        });
    }

    let mut output = Map::new();
    for (name, value) in properties.keys().zip(args) {
        output.insert(name.clone(), value.clone());
    }
    for (name, value) in kwargs {
        if output.contains_key(name) {
            return Err(ConvertError::DuplicateArgument {
                tool: tool.name.clone(),
                name: name.clone(),
            });
        }
        if closed && !properties.contains_key(name) {
            return Err(ConvertError::UnknownArgument {
                tool: tool.name.clone(),
                name: name.clone(),
            });
        }
        output.insert(name.clone(), value.clone());
    }

    output.retain(|name, value| !value.is_null() || required.contains(&name.as_str()));

    for name in &required {
        if !output.contains_key(*name) {
            return Err(ConvertError::MissingRequired {
                tool: tool.name.clone(),
                name: (*name).to_string(),
            });
        }
    }

    for (name, value) in &output {
        let Some(expected) = properties
            .get(name)
            .and_then(|schema| schema.get("type"))
        else {
            continue;
        };
        if !type_matches(expected, value) {
            return Err(ConvertError::TypeMismatch {
                tool: tool.name.clone(),
                name: name.clone(),
                expected: type_label(expected),
                found: json_type(value).to_string(),
            });
        }
    }

    Ok(output)
}

/// Value handed back to the script for a tool result: the structured value if
/// the tool produced one, otherwise its text.
pub fn result_convert(outcome: &ToolOutcome) -> Value {
    outcome
        .value
        .clone()
        .unwrap_or_else(|| Value::String(outcome.text.clone()))
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, value)),
        _ => true,
    }
}

fn single_type_matches(name: &str, value: &Value) -> bool {
    match name {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|num| num.fract() == 0.0)
        }
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_label(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(num) if num.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
