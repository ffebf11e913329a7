//! Field conditions used by condition nodes and trigger filters.
//!
//! A condition compares a field, addressed by a dot path such as
//! `message.text` or `contact.tags`, against an expected value.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Field equals the value.
    Equals,
    /// Field is missing or differs from the value.
    NotEquals,
    /// Text contains the value (case-insensitive) or an array holds it.
    Contains,
    /// Field is numerically (or lexically) greater than the value.
    GreaterThan,
    /// Field is numerically (or lexically) less than the value.
    LessThan,
    /// A tag list holds the value.
    TagHas,
    /// Field is missing, null, blank, or an empty collection.
    FieldIsEmpty,
}

impl ConditionOperator {
    /// Returns true if the operator compares against a value.
    #[must_use]
    pub fn requires_value(self) -> bool {
        !matches!(self, Self::FieldIsEmpty)
    }
}

/// Something a condition can read fields from.
pub trait Lookup {
    /// Resolves a dot path to a value.
    fn lookup(&self, path: &str) -> Option<&JsonValue>;
}

impl Lookup for JsonValue {
    fn lookup(&self, path: &str) -> Option<&JsonValue> {
        resolve_path(self, path)
    }
}

/// Walks a dot path through nested objects and arrays.
///
/// Numeric segments index into arrays. An empty path returns `root`.
pub fn resolve_path<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot path of the field to read.
    pub field: String,
    /// Comparison operator.
    pub operator: ConditionOperator,
    /// Value to compare against. Absent for `field_is_empty`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

impl Condition {
    /// Creates a condition comparing `field` against `value`.
    #[must_use]
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<JsonValue>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: Some(value.into()),
        }
    }

    /// Creates a `field_is_empty` condition.
    #[must_use]
    pub fn is_empty(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: ConditionOperator::FieldIsEmpty,
            value: None,
        }
    }

    /// Checks the condition is well-formed.
    ///
    /// # Errors
    ///
    /// Returns an error if the field is blank or a required value is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.field.trim().is_empty() {
            return Err(ConfigError::new("field", "must not be empty"));
        }
        if self.operator.requires_value() && self.value.is_none() {
            return Err(ConfigError::new(
                "value",
                format!("required for operator {:?}", self.operator),
            ));
        }
        Ok(())
    }

    /// Evaluates the condition against a field source.
    ///
    /// Missing fields never satisfy a comparison, except for `not_equals`
    /// and `field_is_empty`.
    #[must_use]
    pub fn evaluate(&self, source: &impl Lookup) -> bool {
        let actual = source.lookup(&self.field);
        let expected = self.value.as_ref().unwrap_or(&JsonValue::Null);
        match self.operator {
            ConditionOperator::Equals => actual.is_some_and(|a| loosely_equal(a, expected)),
            ConditionOperator::NotEquals => !actual.is_some_and(|a| loosely_equal(a, expected)),
            ConditionOperator::Contains => actual.is_some_and(|a| contains(a, expected)),
            ConditionOperator::GreaterThan => {
                actual.and_then(|a| compare(a, expected)) == Some(Ordering::Greater)
            }
            ConditionOperator::LessThan => {
                actual.and_then(|a| compare(a, expected)) == Some(Ordering::Less)
            }
            ConditionOperator::TagHas => actual.is_some_and(|a| has_tag(a, expected)),
            ConditionOperator::FieldIsEmpty => actual.is_none_or(is_empty_value),
        }
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loosely_equal(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (actual, expected) {
        (JsonValue::String(a), JsonValue::String(b)) => a == b,
        (JsonValue::Number(_), _) | (_, JsonValue::Number(_)) => {
            match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (JsonValue::Bool(a), JsonValue::String(b)) | (JsonValue::String(b), JsonValue::Bool(a)) => {
            b.eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        _ => actual == expected,
    }
}

fn contains(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (actual, expected) {
        // Any of several keywords.
        (JsonValue::String(_), JsonValue::Array(needles)) => {
            needles.iter().any(|needle| contains(actual, needle))
        }
        (JsonValue::String(haystack), JsonValue::String(needle)) => haystack
            .to_lowercase()
            .contains(&needle.to_lowercase()),
        (JsonValue::String(haystack), other) => haystack.contains(&other.to_string()),
        (JsonValue::Array(items), _) => items.iter().any(|item| loosely_equal(item, expected)),
        (JsonValue::Object(map), JsonValue::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn compare(actual: &JsonValue, expected: &JsonValue) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn has_tag(actual: &JsonValue, expected: &JsonValue) -> bool {
    let Some(wanted) = expected.as_str() else {
        return false;
    };
    let JsonValue::Array(tags) = actual else {
        return false;
    };
    tags.iter().any(|tag| {
        let name = match tag {
            JsonValue::String(s) => Some(s.as_str()),
            JsonValue::Object(map) => map.get("name").and_then(JsonValue::as_str),
            _ => None,
        };
        name.is_some_and(|n| n.eq_ignore_ascii_case(wanted))
    })
}

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> JsonValue {
        json!({
            "message": { "text": "Hello, I need HELP with my order" },
            "contact": {
                "name": "Ana",
                "tags": ["vip", { "name": "Returning" }],
                "orders": 3,
                "email": ""
            },
            "items": [{ "sku": "A-1" }]
        })
    }

    #[test]
    fn resolves_nested_paths_and_array_indexes() {
        let p = payload();
        assert_eq!(resolve_path(&p, "contact.name"), Some(&json!("Ana")));
        assert_eq!(resolve_path(&p, "items.0.sku"), Some(&json!("A-1")));
        assert_eq!(resolve_path(&p, "items.7.sku"), None);
        assert_eq!(resolve_path(&p, "contact.name.first"), None);
    }

    #[test]
    fn contains_is_case_insensitive() {
        let condition = Condition::new("message.text", ConditionOperator::Contains, "help");
        assert!(condition.evaluate(&payload()));
    }

    #[test]
    fn contains_any_keyword() {
        let condition = Condition::new(
            "message.text",
            ConditionOperator::Contains,
            json!(["refund", "order"]),
        );
        assert!(condition.evaluate(&payload()));

        let miss = Condition::new(
            "message.text",
            ConditionOperator::Contains,
            json!(["refund", "invoice"]),
        );
        assert!(!miss.evaluate(&payload()));
    }

    #[test]
    fn numeric_comparisons_coerce_strings() {
        let p = json!({ "total": "42.5" });
        assert!(Condition::new("total", ConditionOperator::GreaterThan, 40).evaluate(&p));
        assert!(Condition::new("total", ConditionOperator::LessThan, "50").evaluate(&p));
        assert!(!Condition::new("total", ConditionOperator::GreaterThan, 42.5).evaluate(&p));
    }

    #[test]
    fn equals_compares_numbers_by_value() {
        let p = payload();
        assert!(Condition::new("contact.orders", ConditionOperator::Equals, 3.0).evaluate(&p));
        assert!(Condition::new("contact.orders", ConditionOperator::Equals, "3").evaluate(&p));
        assert!(!Condition::new("contact.name", ConditionOperator::Equals, "ana").evaluate(&p));
    }

    #[test]
    fn not_equals_holds_for_missing_field() {
        let condition = Condition::new("contact.phone", ConditionOperator::NotEquals, "123");
        assert!(condition.evaluate(&payload()));
    }

    #[test]
    fn missing_field_fails_comparisons() {
        let condition = Condition::new("contact.phone", ConditionOperator::Contains, "1");
        assert!(!condition.evaluate(&payload()));
    }

    #[test]
    fn tag_has_matches_strings_and_named_tags() {
        let p = payload();
        assert!(Condition::new("contact.tags", ConditionOperator::TagHas, "VIP").evaluate(&p));
        assert!(Condition::new("contact.tags", ConditionOperator::TagHas, "returning").evaluate(&p));
        assert!(!Condition::new("contact.tags", ConditionOperator::TagHas, "churned").evaluate(&p));
    }

    #[test]
    fn field_is_empty() {
        let p = payload();
        assert!(Condition::is_empty("contact.email").evaluate(&p));
        assert!(Condition::is_empty("contact.phone").evaluate(&p));
        assert!(!Condition::is_empty("contact.name").evaluate(&p));
    }

    #[test]
    fn validate_requires_value_for_comparisons() {
        let condition = Condition {
            field: "contact.name".to_string(),
            operator: ConditionOperator::Equals,
            value: None,
        };
        assert_eq!(condition.validate().map_err(|e| e.field), Err("value".to_string()));
        assert!(Condition::is_empty("contact.name").validate().is_ok());
    }

    #[test]
    fn condition_serialization() {
        let json = json!({ "field": "message.text", "operator": "contains", "value": "hello" });
        let condition: Condition = serde_json::from_value(json).expect("deserialize");
        assert_eq!(condition.operator, ConditionOperator::Contains);
        assert_eq!(condition.value, Some(json!("hello")));
    }
}
