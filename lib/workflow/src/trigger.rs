//! Inbound events and trigger matching.
//!
//! Every definition has exactly one trigger node. The trigger names the
//! event type it listens for and optional field filters; an event starts
//! one run per enabled definition in the same organization whose trigger
//! accepts it.

use crate::condition::Condition;
use crate::context::ExecutionContext;
use crate::definition::WorkflowDefinition;
use crate::error::ConfigError;
use autoflow_core::{EventId, OrganizationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The kinds of events that can start a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A contact sent a message on any channel.
    MessageReceived,
    /// A new contact was created.
    ContactCreated,
    /// A periodic schedule fired.
    ScheduleTick,
    /// An external system called the inbound webhook.
    WebhookReceived,
    /// A user started the workflow by hand.
    Manual,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MessageReceived => "message_received",
            Self::ContactCreated => "contact_created",
            Self::ScheduleTick => "schedule_tick",
            Self::WebhookReceived => "webhook_received",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// An inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: EventId,
    /// What happened.
    pub event_type: EventType,
    /// The organization the event belongs to.
    pub organization_id: OrganizationId,
    /// Event body, usually an object such as `{"message": {...}, "contact": {...}}`.
    pub payload: JsonValue,
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Creates a new event occurring now.
    #[must_use]
    pub fn new(organization_id: OrganizationId, event_type: EventType, payload: JsonValue) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            organization_id,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

/// Configuration of a trigger node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Event type that starts the workflow.
    pub event_type: EventType,
    /// Filters that must all hold for the event to match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TriggerConfig {
    /// Creates a trigger for an event type with no filters.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            conditions: Vec::new(),
        }
    }

    /// Adds a filter condition.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Checks every filter is well-formed.
    ///
    /// # Errors
    ///
    /// Returns the first malformed filter's error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.conditions.iter().try_for_each(|condition| {
            condition
                .validate()
                .map_err(|e| ConfigError::new(format!("conditions.{}", e.field), e.reason))
        })
    }

    /// Returns true if the event type and every filter match.
    #[must_use]
    pub fn accepts(&self, event_type: EventType, fields: &ExecutionContext) -> bool {
        self.event_type == event_type && self.conditions.iter().all(|c| c.evaluate(fields))
    }
}

/// Selects the definitions an event starts.
///
/// Matching is pure: it reads the definitions and the event, nothing else.
pub struct TriggerMatcher;

impl TriggerMatcher {
    /// Returns the definitions the event should start, in input order.
    ///
    /// A definition matches when it is enabled, belongs to the event's
    /// organization, and its trigger accepts the event.
    #[must_use]
    pub fn match_event<'a>(
        definitions: &'a [WorkflowDefinition],
        event: &Event,
    ) -> Vec<&'a WorkflowDefinition> {
        let fields = ExecutionContext::seed(event);
        definitions
            .iter()
            .filter(|definition| Self::accepts(definition, event, &fields))
            .collect()
    }

    fn accepts(definition: &WorkflowDefinition, event: &Event, fields: &ExecutionContext) -> bool {
        definition.is_enabled()
            && definition.organization_id == event.organization_id
            && definition
                .trigger_config()
                .is_some_and(|trigger| trigger.accepts(event.event_type, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionOperator;
    use crate::graph::WorkflowGraph;
    use crate::node::{Node, NodeConfig};
    use serde_json::json;

    fn definition(org: OrganizationId, trigger: TriggerConfig, enabled: bool) -> WorkflowDefinition {
        let mut graph = WorkflowGraph::new();
        graph.add_node(Node::with_id("start", "Start", NodeConfig::Trigger(trigger)));
        let mut definition = WorkflowDefinition::new(org, "Greeting");
        definition.graph = graph;
        definition.metadata.enabled = enabled;
        definition
    }

    fn message(org: OrganizationId, text: &str) -> Event {
        Event::new(
            org,
            EventType::MessageReceived,
            json!({ "message": { "text": text }, "contact": { "name": "Ana" } }),
        )
    }

    #[test]
    fn matches_enabled_definitions_for_event_type() {
        let org = OrganizationId::new();
        let defs = vec![
            definition(org, TriggerConfig::new(EventType::MessageReceived), true),
            definition(org, TriggerConfig::new(EventType::ContactCreated), true),
            definition(org, TriggerConfig::new(EventType::MessageReceived), false),
        ];
        let matched = TriggerMatcher::match_event(&defs, &message(org, "hi"));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, defs[0].id);
    }

    #[test]
    fn ignores_other_organizations() {
        let org = OrganizationId::new();
        let defs = vec![definition(
            OrganizationId::new(),
            TriggerConfig::new(EventType::MessageReceived),
            true,
        )];
        assert!(TriggerMatcher::match_event(&defs, &message(org, "hi")).is_empty());
    }

    #[test]
    fn filters_must_all_hold() {
        let org = OrganizationId::new();
        let trigger = TriggerConfig::new(EventType::MessageReceived)
            .with_condition(Condition::new(
                "message.text",
                ConditionOperator::Contains,
                "price",
            ))
            .with_condition(Condition::new(
                "contact.name",
                ConditionOperator::Equals,
                "Ana",
            ));
        let defs = vec![definition(org, trigger, true)];

        assert_eq!(
            TriggerMatcher::match_event(&defs, &message(org, "What is the PRICE?")).len(),
            1
        );
        assert!(TriggerMatcher::match_event(&defs, &message(org, "hello")).is_empty());
    }

    #[test]
    fn filters_can_read_event_metadata() {
        let org = OrganizationId::new();
        let trigger = TriggerConfig::new(EventType::MessageReceived).with_condition(
            Condition::new("event.type", ConditionOperator::Equals, "message_received"),
        );
        let defs = vec![definition(org, trigger, true)];
        assert_eq!(TriggerMatcher::match_event(&defs, &message(org, "x")).len(), 1);
    }

    #[test]
    fn event_type_serialization() {
        let json = serde_json::to_string(&EventType::WebhookReceived).expect("serialize");
        assert_eq!(json, "\"webhook_received\"");
        assert_eq!(EventType::ScheduleTick.to_string(), "schedule_tick");
    }
}
