//! Error types for the workflow crate.
//!
//! - `ConfigError`: a node configuration failed its kind-specific schema
//! - `ValidationError`: a definition is malformed (reported at save time)
//! - `GraphError`: low-level graph construction failures
//! - `ContextError`: execution context writes that would change a value's type
//! - `StoreError`: collaborator store failures

use crate::edge::EdgeLabel;
use crate::node::NodeId;
use std::fmt;

/// A node configuration that fails its kind-specific schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    /// The offending configuration field.
    pub field: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl ConfigError {
    /// Creates a new config error.
    #[must_use]
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid '{}': {}", self.field, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// A structural or configuration defect in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The definition has no trigger node.
    MissingTrigger,
    /// The definition has more than one trigger node.
    MultipleTriggers { node_ids: Vec<NodeId> },
    /// Two nodes share the same id.
    DuplicateNodeId { node_id: NodeId },
    /// An edge references a node that does not exist.
    DanglingEdge { source: NodeId, target: NodeId },
    /// The trigger node has an incoming edge.
    TriggerHasIncomingEdge { node_id: NodeId },
    /// A condition node lacks one of its branches.
    MissingBranch { node_id: NodeId, branch: EdgeLabel },
    /// A condition node has the same branch twice.
    DuplicateBranch { node_id: NodeId, branch: EdgeLabel },
    /// A condition node has an outgoing edge without a branch label.
    UnlabeledBranch { node_id: NodeId },
    /// A non-condition node has a labeled outgoing edge.
    UnexpectedBranchLabel { node_id: NodeId },
    /// A node that allows at most one outgoing edge has several.
    TooManyOutgoingEdges { node_id: NodeId, count: usize },
    /// A cycle is reachable from the trigger; `node_id` lies on it.
    CycleDetected { node_id: NodeId },
    /// The definition exceeds the node limit.
    TooManyNodes { count: usize, max: usize },
    /// A node's configuration fails its schema.
    InvalidConfig { node_id: NodeId, error: ConfigError },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTrigger => write!(f, "workflow has no trigger node"),
            Self::MultipleTriggers { node_ids } => {
                let ids: Vec<String> = node_ids.iter().map(ToString::to_string).collect();
                write!(f, "workflow has multiple trigger nodes: {}", ids.join(", "))
            }
            Self::DuplicateNodeId { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::DanglingEdge { source, target } => {
                write!(f, "edge {source} -> {target} references a missing node")
            }
            Self::TriggerHasIncomingEdge { node_id } => {
                write!(f, "trigger node {node_id} has an incoming edge")
            }
            Self::MissingBranch { node_id, branch } => {
                write!(f, "condition node {node_id} has no '{branch}' branch")
            }
            Self::DuplicateBranch { node_id, branch } => {
                write!(f, "condition node {node_id} has more than one '{branch}' branch")
            }
            Self::UnlabeledBranch { node_id } => {
                write!(f, "condition node {node_id} has an unlabeled outgoing edge")
            }
            Self::UnexpectedBranchLabel { node_id } => {
                write!(f, "node {node_id} is not a condition but has a labeled edge")
            }
            Self::TooManyOutgoingEdges { node_id, count } => {
                write!(f, "node {node_id} has {count} outgoing edges, at most 1 allowed")
            }
            Self::CycleDetected { node_id } => write!(f, "cycle detected at node {node_id}"),
            Self::TooManyNodes { count, max } => {
                write!(f, "workflow has {count} nodes, maximum is {max}")
            }
            Self::InvalidConfig { node_id, error } => {
                write!(f, "node {node_id} configuration {error}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors from graph construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Node with the given ID was not found in the graph.
    NodeNotFound { node_id: NodeId },
    /// A node with the given ID already exists.
    DuplicateNode { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
            Self::DuplicateNode { node_id } => write!(f, "node already exists: {node_id}"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from execution context writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The key already holds a value of a different JSON type.
    TypeConflict {
        key: String,
        existing: &'static str,
        attempted: &'static str,
    },
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeConflict {
                key,
                existing,
                attempted,
            } => write!(
                f,
                "context key '{key}' holds a {existing}, refusing to overwrite with a {attempted}"
            ),
        }
    }
}

impl std::error::Error for ContextError {}

/// Errors from definition, execution and idempotency stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist.
    NotFound { entity: &'static str, id: String },
    /// The definition failed validation and cannot be saved as enabled.
    Rejected { errors: Vec<ValidationError> },
    /// A record could not be encoded or decoded.
    Serialization { message: String },
    /// The backing store failed.
    Backend { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Rejected { errors } => {
                write!(f, "definition rejected with {} validation error(s)", errors.len())?;
                if let Some(first) = errors.first() {
                    write!(f, ": {first}")?;
                }
                Ok(())
            }
            Self::Serialization { message } => write!(f, "serialization failed: {message}"),
            Self::Backend { message } => write!(f, "store backend failed: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}
