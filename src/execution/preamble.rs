//! Script-facing description of the available tools.

use super::tools::ToolDefinition;
use serde_json::Value;

const HEADER: &[&str] = &[
    "; Tools are available as functions. Call them directly.",
    "; Tool failures raise ToolError (alias of RuntimeError).",
    "; Use (print ...) for logs; the last expression is returned.",
];

/// Render a comment block listing every callable tool as a call signature.
///
/// Required parameters come first; optional ones carry a trailing `?`. Tools
/// whose names are not valid symbols are skipped.
pub fn preamble_build(tools: &[ToolDefinition]) -> String {
    let mut lines: Vec<String> = HEADER.iter().map(|line| line.to_string()).collect();
    lines.push(";".to_string());

    let mut listed = 0;
    for tool in tools {
        if !symbol_is(&tool.name) {
            continue;
        }
        listed += 1;
        let signature = signature_build(tool);
        if signature.is_empty() {
            lines.push(format!("; ({})", tool.name));
        } else {
            lines.push(format!("; ({} {signature})", tool.name));
        }
        let description = tool.description.trim();
        let description = if description.is_empty() {
            "No description."
        } else {
            description
        };
        for line in description.lines() {
            lines.push(format!(";   {}", line.trim_end()));
        }
    }
    if listed == 0 {
        lines.push("; (no tools available)".to_string());
    }
    lines.join("\n")
}

fn signature_build(tool: &ToolDefinition) -> String {
    let Some(properties) = tool
        .parameters
        .get("properties")
        .and_then(Value::as_object)
    else {
        return String::new();
    };
    let required: Vec<&str> = tool
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut mandatory = Vec::new();
    let mut optional = Vec::new();
    for (name, schema) in properties {
        if !symbol_is(name) {
            continue;
        }
        let hint = type_hint(schema);
        if required.contains(&name.as_str()) {
            mandatory.push(format!(":{name} <{hint}>"));
        } else {
            optional.push(format!(":{name}? <{hint}>"));
        }
    }
    mandatory.extend(optional);
    mandatory.join(" ")
}

fn type_hint(schema: &Value) -> String {
    for union_key in ["anyOf", "oneOf"] {
        if let Some(options) = schema.get(union_key).and_then(Value::as_array) {
            let mut hints: Vec<String> = Vec::new();
            for hint in options.iter().map(type_hint) {
                if !hints.contains(&hint) {
                    hints.push(hint);
                }
            }
            if !hints.is_empty() {
                return hints.join(" | ");
            }
        }
    }
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return values
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(" | ");
    }
    match schema.get("type") {
        Some(Value::String(name)) if name == "array" => match schema.get("items") {
            Some(items) => format!("list {}", type_hint(items)),
            None => "list".to_string(),
        },
        Some(Value::String(name)) => script_type(name).to_string(),
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .map(script_type)
            .collect::<Vec<_>>()
            .join(" | "),
        _ => "any".to_string(),
    }
}

fn script_type(json_type: &str) -> &str {
    match json_type {
        "string" => "str",
        "integer" => "int",
        "number" => "float",
        "boolean" => "bool",
        "object" => "dict",
        "array" => "list",
        "null" => "nil",
        other => other,
    }
}

/// Whether `name` can be written as a bare symbol in a script.
pub fn symbol_is(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}
