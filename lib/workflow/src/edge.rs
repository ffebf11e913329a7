//! Edge types for workflow graphs.
//!
//! Edges are directed transitions between nodes. Edges leaving a condition
//! node carry a branch label; all other edges are unlabeled.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The branch a condition edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLabel {
    /// Followed when the condition holds.
    True,
    /// Followed when the condition does not hold.
    False,
}

impl EdgeLabel {
    /// Returns the label for a condition outcome.
    #[must_use]
    pub fn from_outcome(outcome: bool) -> Self {
        if outcome { Self::True } else { Self::False }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
        }
    }
}

/// Edge weight stored in the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Branch label, present only on edges leaving a condition node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

impl Edge {
    /// An unlabeled edge.
    #[must_use]
    pub fn unlabeled() -> Self {
        Self { label: None }
    }

    /// A condition branch edge.
    #[must_use]
    pub fn branch(label: EdgeLabel) -> Self {
        Self { label: Some(label) }
    }
}

/// A complete edge reference including source and target node IDs.
///
/// This is the stored representation of an edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRef {
    /// The source node ID.
    pub source: NodeId,
    /// The target node ID.
    pub target: NodeId,
    /// Branch label for condition edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<EdgeLabel>,
}

impl EdgeRef {
    /// Creates an unlabeled edge reference.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    /// Creates a labeled condition branch reference.
    #[must_use]
    pub fn branch(source: impl Into<NodeId>, target: impl Into<NodeId>, label: EdgeLabel) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: Some(label),
        }
    }
}
