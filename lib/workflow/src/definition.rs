//! Workflow definition types.
//!
//! A workflow definition is a named, versioned automation owned by one
//! organization. It consists of:
//! - Metadata (name, description, enabled flag, timestamps)
//! - A directed graph of nodes with exactly one trigger
//!
//! Executions pin the version they started on, so editing a definition
//! never changes a run in flight.

use crate::error::ValidationError;
use crate::graph::{GraphLimits, WorkflowGraph};
use crate::trigger::TriggerConfig;
use autoflow_core::{OrganizationId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Human-readable name for this workflow.
    pub name: String,
    /// Description of what this workflow does.
    pub description: Option<String>,
    /// Whether this workflow reacts to events.
    pub enabled: bool,
    /// Tags for organization/filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When this workflow was created.
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMetadata {
    /// Creates new metadata for a disabled draft.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            enabled: false,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// Monotonic version, assigned by the definition store on save.
    pub version: u32,
    /// Workflow metadata.
    pub metadata: WorkflowMetadata,
    /// The workflow graph (nodes and edges).
    pub graph: WorkflowGraph,
}

impl WorkflowDefinition {
    /// Creates a new empty, disabled workflow.
    #[must_use]
    pub fn new(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        Self::with_id(WorkflowId::new(), organization_id, name)
    }

    /// Creates a workflow with a specific ID.
    #[must_use]
    pub fn with_id(
        id: WorkflowId,
        organization_id: OrganizationId,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            organization_id,
            version: 0,
            metadata: WorkflowMetadata::new(name),
            graph: WorkflowGraph::new(),
        }
    }

    /// Replaces the graph.
    #[must_use]
    pub fn with_graph(mut self, graph: WorkflowGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns whether the workflow is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.metadata.enabled
    }

    /// Enables the workflow after validating it.
    ///
    /// # Errors
    ///
    /// Returns every validation error if the graph is malformed; the
    /// workflow stays disabled.
    pub fn enable(&mut self, limits: &GraphLimits) -> Result<(), Vec<ValidationError>> {
        let errors = self.validate(limits);
        if !errors.is_empty() {
            return Err(errors);
        }
        self.metadata.enabled = true;
        self.touch();
        Ok(())
    }

    /// Disables the workflow.
    pub fn disable(&mut self) {
        self.metadata.enabled = false;
        self.touch();
    }

    /// Validates the workflow graph.
    #[must_use]
    pub fn validate(&self, limits: &GraphLimits) -> Vec<ValidationError> {
        self.graph.validate(limits)
    }

    /// Returns the trigger configuration, if the graph has exactly one trigger.
    #[must_use]
    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        self.graph.trigger_config()
    }

    /// Marks the workflow as updated (bumps updated_at timestamp).
    pub fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Latest version.
    pub version: u32,
    /// Workflow name.
    pub name: String,
    /// Description, if any.
    pub description: Option<String>,
    /// Whether enabled.
    pub enabled: bool,
    /// Tags.
    pub tags: Vec<String>,
    /// Number of nodes in the graph.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(definition: &WorkflowDefinition) -> Self {
        Self {
            id: definition.id,
            version: definition.version,
            name: definition.metadata.name.clone(),
            description: definition.metadata.description.clone(),
            enabled: definition.metadata.enabled,
            tags: definition.metadata.tags.clone(),
            node_count: definition.graph.node_count(),
            updated_at: definition.metadata.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::{DelayConfig, DelayUnit, Node, NodeConfig};
    use crate::trigger::EventType;

    fn graph(with_trigger: bool) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        graph.add_node(Node::with_id(
            "wait",
            "Wait",
            NodeConfig::Delay(DelayConfig::new(1, DelayUnit::Hours)),
        ));
        if with_trigger {
            graph.add_node(Node::with_id(
                "start",
                "Start",
                NodeConfig::Trigger(TriggerConfig::new(EventType::ContactCreated)),
            ));
            graph.add_edge("start", "wait", Edge::unlabeled()).expect("edge");
        }
        graph
    }

    #[test]
    fn new_definitions_start_disabled() {
        let definition = WorkflowDefinition::new(OrganizationId::new(), "Welcome");
        assert!(!definition.is_enabled());
        assert_eq!(definition.version, 0);
        assert_eq!(definition.name(), "Welcome");
    }

    #[test]
    fn enable_validates_first() {
        let mut broken = WorkflowDefinition::new(OrganizationId::new(), "Broken").with_graph(graph(false));
        let errors = broken.enable(&GraphLimits::default()).expect_err("invalid");
        assert_eq!(errors, vec![ValidationError::MissingTrigger]);
        assert!(!broken.is_enabled());

        let mut valid = WorkflowDefinition::new(OrganizationId::new(), "Valid").with_graph(graph(true));
        valid.enable(&GraphLimits::default()).expect("valid");
        assert!(valid.is_enabled());
        assert_eq!(
            valid.trigger_config().map(|t| t.event_type),
            Some(EventType::ContactCreated)
        );

        valid.disable();
        assert!(!valid.is_enabled());
    }

    #[test]
    fn summary_from_definition() {
        let definition = WorkflowDefinition::new(OrganizationId::new(), "Welcome").with_graph(graph(true));
        let summary = WorkflowSummary::from(&definition);
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.name, "Welcome");
    }

    #[test]
    fn definition_serde_roundtrip() {
        let definition = WorkflowDefinition::new(OrganizationId::new(), "Welcome").with_graph(graph(true));
        let json = serde_json::to_string(&definition).expect("serialize");
        let parsed: WorkflowDefinition = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, definition.id);
        assert_eq!(parsed.graph.node_count(), 2);
        assert!(parsed.validate(&GraphLimits::default()).is_empty());
    }
}
