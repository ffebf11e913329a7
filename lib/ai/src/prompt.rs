//! Prompt templates with `{{path}}` placeholders.
//!
//! Placeholders name a variable path (`contact.name`, `classify.result`).
//! The same scanner backs message templates and webhook bodies in the
//! workflow crate, so every templated string in a definition behaves alike.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// A prompt template for an `ai_response` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Template name, used in logs.
    pub name: String,
    /// Template content with placeholders.
    pub content: String,
    /// Optional system prompt template.
    pub system_prompt: Option<String>,
}

impl PromptTemplate {
    /// Creates a new prompt template.
    #[must_use]
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            system_prompt: None,
        }
    }

    /// Sets the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    /// Returns every distinct placeholder referenced by the prompt and the
    /// system prompt, in order of first appearance.
    #[must_use]
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = placeholders(&self.content);
        if let Some(system) = &self.system_prompt {
            for name in placeholders(system) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Renders the template with the given variables.
    #[must_use]
    pub fn render(&self, variables: &HashMap<String, JsonValue>) -> String {
        substitute(&self.content, variables)
    }

    /// Renders the system prompt with the given variables.
    #[must_use]
    pub fn render_system_prompt(&self, variables: &HashMap<String, JsonValue>) -> Option<String> {
        self.system_prompt
            .as_ref()
            .map(|template| substitute(template, variables))
    }
}

/// Returns the distinct placeholder names in `text`.
///
/// Whitespace inside the braces is ignored, so `{{ name }}` and `{{name}}`
/// are the same placeholder. An unterminated `{{` is treated as literal text.
#[must_use]
pub fn placeholders(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        let name = after_open[..end].trim();
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    names
}

/// Replaces every placeholder in `text` with its value from `variables`.
///
/// Strings are inserted verbatim, other JSON values in their compact JSON
/// form. Placeholders without a value render as the empty string.
#[must_use]
pub fn substitute(text: &str, variables: &HashMap<String, JsonValue>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = after_open[..end].trim();
        match variables.get(name) {
            Some(JsonValue::String(s)) => out.push_str(s),
            Some(JsonValue::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after_open[end + CLOSE.len()..];
    }
    out.push_str(rest);
    out
}
