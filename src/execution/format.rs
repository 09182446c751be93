use serde_json::Value;

/// Render a script value as host-displayable text.
///
/// `null` renders empty, strings verbatim, numbers and booleans in their JSON
/// form, arrays as their rendered elements joined by `", "`, and objects as
/// compact JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(num) => num.to_string(),
        Value::Array(items) => items
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    }
}
