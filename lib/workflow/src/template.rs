//! Rendering of `{{path}}` templates against an execution context.
//!
//! Uses the same placeholder scanner as AI prompts.

use crate::context::ExecutionContext;
use autoflow_ai::prompt::{placeholders, substitute};
use serde_json::Value as JsonValue;

/// Renders a text template. Unresolved placeholders become empty.
#[must_use]
pub fn render(text: &str, context: &ExecutionContext) -> String {
    let names = placeholders(text);
    if names.is_empty() {
        return text.to_string();
    }
    substitute(text, &context.variables_for(&names))
}

/// Renders every string leaf of a JSON value.
///
/// A string that is exactly one placeholder is replaced by the raw value,
/// so `"{{contact.tags}}"` yields the array rather than its JSON text.
#[must_use]
pub fn render_value(value: &JsonValue, context: &ExecutionContext) -> JsonValue {
    match value {
        JsonValue::String(text) => {
            if let Some(path) = sole_placeholder(text) {
                return context.get(path).cloned().unwrap_or(JsonValue::Null);
            }
            JsonValue::String(render(text, context))
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|item| render_value(item, context)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), render_value(item, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
