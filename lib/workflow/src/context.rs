//! Per-run key/value store.
//!
//! The context is seeded from the triggering event and grows as nodes
//! record outputs under `<node_id>.<key>`. Reads accept dot paths that
//! continue into nested JSON, so `send.output.message_id` resolves inside
//! the object stored at `send.output`.

use crate::condition::{Lookup, resolve_path};
use crate::error::ContextError;
use crate::node::NodeId;
use crate::trigger::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, HashMap};

/// Key under which event metadata is seeded.
pub const EVENT_KEY: &str = "event";

/// Execution context for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    values: BTreeMap<String, JsonValue>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a context from an event.
    ///
    /// Top-level payload fields become top-level keys; event metadata is
    /// stored under `event`. A non-object payload is kept under `payload`.
    #[must_use]
    pub fn seed(event: &Event) -> Self {
        let mut values = BTreeMap::new();
        match &event.payload {
            JsonValue::Object(fields) => {
                for (key, value) in fields {
                    values.insert(key.clone(), value.clone());
                }
            }
            JsonValue::Null => {}
            other => {
                values.insert("payload".to_string(), other.clone());
            }
        }
        values.insert(
            EVENT_KEY.to_string(),
            json!({
                "id": event.id.to_string(),
                "type": event.event_type.to_string(),
                "organization_id": event.organization_id.to_string(),
                "occurred_at": event.occurred_at.to_rfc3339(),
            }),
        );
        Self { values }
    }

    /// Restores a context from a checkpoint snapshot.
    #[must_use]
    pub fn from_snapshot(values: BTreeMap<String, JsonValue>) -> Self {
        Self { values }
    }

    /// Returns a copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, JsonValue> {
        self.values.clone()
    }

    /// Resolves a key or dot path.
    ///
    /// An exact key wins; otherwise the longest stored key that prefixes the
    /// path is resolved and the remainder walked through its JSON value.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        if let Some(value) = self.values.get(path) {
            return Some(value);
        }
        for (idx, _) in path.rmatch_indices('.') {
            if let Some(root) = self.values.get(&path[..idx]) {
                return resolve_path(root, &path[idx + 1..]);
            }
        }
        None
    }

    /// Records a node output under `<node_id>.<key>`.
    ///
    /// # Errors
    ///
    /// Returns `TypeConflict` if the key already resolves to a value of a
    /// different JSON type, including a seeded field reached through a dot
    /// path. Null is compatible with every type.
    pub fn set(&mut self, node_id: &NodeId, key: &str, value: JsonValue) -> Result<(), ContextError> {
        let full_key = format!("{node_id}.{key}");
        if let Some(existing) = self.get(&full_key) {
            let (old, new) = (type_name(existing), type_name(&value));
            if old != new && !existing.is_null() && !value.is_null() {
                return Err(ContextError::TypeConflict {
                    key: full_key,
                    existing: old,
                    attempted: new,
                });
            }
        }
        self.values.insert(full_key, value);
        Ok(())
    }

    /// Collects the values for the given paths, skipping unresolved ones.
    #[must_use]
    pub fn variables_for(&self, paths: &[String]) -> HashMap<String, JsonValue> {
        paths
            .iter()
            .filter_map(|path| self.get(path).map(|value| (path.clone(), value.clone())))
            .collect()
    }

    /// Returns true if the exact key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over stored entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.values.iter()
    }
}

impl Lookup for ExecutionContext {
    fn lookup(&self, path: &str) -> Option<&JsonValue> {
        self.get(path)
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::EventType;
    use autoflow_core::OrganizationId;

    fn event() -> Event {
        Event::new(
            OrganizationId::new(),
            EventType::MessageReceived,
            json!({
                "message": { "text": "hello" },
                "contact": { "id": "c_1", "name": "Ana" }
            }),
        )
    }

    #[test]
    fn seed_exposes_payload_and_event_metadata() {
        let context = ExecutionContext::seed(&event());
        assert_eq!(context.get("message.text"), Some(&json!("hello")));
        assert_eq!(context.get("contact.name"), Some(&json!("Ana")));
        assert_eq!(context.get("event.type"), Some(&json!("message_received")));
        assert!(context.contains_key("event"));
    }

    #[test]
    fn non_object_payload_is_kept_under_payload() {
        let mut e = event();
        e.payload = json!("raw body");
        let context = ExecutionContext::seed(&e);
        assert_eq!(context.get("payload"), Some(&json!("raw body")));
    }

    #[test]
    fn set_namespaces_by_node() {
        let mut context = ExecutionContext::new();
        let node = NodeId::new("send");
        context
            .set(&node, "output", json!({ "message_id": "m_9" }))
            .expect("set");
        assert!(context.contains_key("send.output"));
        assert_eq!(context.get("send.output.message_id"), Some(&json!("m_9")));
    }

    #[test]
    fn set_rejects_type_changes() {
        let mut context = ExecutionContext::new();
        let node = NodeId::new("check");
        context.set(&node, "result", json!(true)).expect("set");
        context.set(&node, "result", json!(false)).expect("same type");
        let err = context
            .set(&node, "result", json!("yes"))
            .expect_err("type conflict");
        assert!(matches!(err, ContextError::TypeConflict { existing: "boolean", .. }));
    }

    #[test]
    fn set_cannot_shadow_seeded_field_with_other_type() {
        let mut e = event();
        e.payload = json!({ "check": { "result": "yes" } });
        let mut context = ExecutionContext::seed(&e);
        let node = NodeId::new("check");

        let err = context
            .set(&node, "result", json!(true))
            .expect_err("type conflict");
        assert!(matches!(
            err,
            ContextError::TypeConflict { existing: "string", attempted: "boolean", .. }
        ));
        assert_eq!(context.get("check.result"), Some(&json!("yes")));

        context.set(&node, "result", json!("no")).expect("same type");
        assert_eq!(context.get("check.result"), Some(&json!("no")));
    }

    #[test]
    fn null_is_compatible_with_any_type() {
        let mut context = ExecutionContext::new();
        let node = NodeId::new("n");
        context.set(&node, "v", JsonValue::Null).expect("set null");
        context.set(&node, "v", json!(3)).expect("replace null");
        context.set(&node, "v", JsonValue::Null).expect("clear");
    }

    #[test]
    fn variables_for_skips_missing() {
        let context = ExecutionContext::seed(&event());
        let vars = context.variables_for(&["contact.name".to_string(), "nope".to_string()]);
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["contact.name"], json!("Ana"));
    }

    #[test]
    fn snapshot_roundtrip() {
        let context = ExecutionContext::seed(&event());
        let restored = ExecutionContext::from_snapshot(context.snapshot());
        assert_eq!(restored, context);

        let json = serde_json::to_value(&context).expect("serialize");
        assert_eq!(json["message"]["text"], "hello");
    }
}
