//! Workflow graph implementation using petgraph.
//!
//! Workflows are directed graphs where:
//! - Nodes are workflow steps (trigger, condition, action, delay, AI response)
//! - Edges are transitions, labeled `true`/`false` when leaving a condition
//!
//! The stored form is a flat `{nodes, edges}` document. Edges whose
//! endpoints are unknown and nodes with repeated ids are kept aside on load
//! so validation can report them instead of silently dropping them.

use crate::edge::{Edge, EdgeLabel, EdgeRef};
use crate::error::{GraphError, ValidationError};
use crate::node::{Node, NodeConfig, NodeId, NodeKind};
use crate::trigger::TriggerConfig;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Control, DfsEvent, EdgeRef as _, depth_first_search};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default cap on nodes per definition.
pub const DEFAULT_MAX_NODES: usize = 100;

/// Size limits applied during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphLimits {
    /// Maximum number of nodes in one definition.
    pub max_nodes: usize,
}

impl Default for GraphLimits {
    fn default() -> Self {
        Self {
            max_nodes: DEFAULT_MAX_NODES,
        }
    }
}

/// A workflow graph using petgraph's directed graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "GraphDocument", into = "GraphDocument")]
pub struct WorkflowGraph {
    /// The underlying directed graph.
    graph: DiGraph<Node, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
    /// Nodes whose id was already taken.
    duplicates: Vec<Node>,
    /// Edges referencing unknown nodes.
    dangling: Vec<EdgeRef>,
}

impl WorkflowGraph {
    /// Creates a new empty workflow graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_index_map: HashMap::new(),
            duplicates: Vec::new(),
            dangling: Vec::new(),
        }
    }

    /// Adds a node to the graph.
    ///
    /// Returns the node ID. A node whose id is already present is kept
    /// aside and reported by [`validate`](Self::validate).
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let node_id = node.id.clone();
        if self.node_index_map.contains_key(&node_id) {
            self.duplicates.push(node);
        } else {
            let index = self.graph.add_node(node);
            self.node_index_map.insert(node_id.clone(), index);
        }
        node_id
    }

    /// Returns a reference to a node by its ID.
    #[must_use]
    pub fn get_node(&self, node_id: &NodeId) -> Option<&Node> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Adds an edge between two nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if the source or target node doesn't exist.
    pub fn add_edge(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
        edge: Edge,
    ) -> Result<(), GraphError> {
        let (source, target) = (source.into(), target.into());
        let source_index = *self
            .node_index_map
            .get(&source)
            .ok_or(GraphError::NodeNotFound { node_id: source })?;
        let target_index = *self
            .node_index_map
            .get(&target)
            .ok_or(GraphError::NodeNotFound { node_id: target })?;
        self.graph.add_edge(source_index, target_index, edge);
        Ok(())
    }

    /// Returns all nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Returns all edges as references.
    #[must_use]
    pub fn edges(&self) -> Vec<EdgeRef> {
        self.graph
            .edge_references()
            .map(|e| EdgeRef {
                source: self.graph[e.source()].id.clone(),
                target: self.graph[e.target()].id.clone(),
                label: e.weight().label,
            })
            .collect()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns every trigger node.
    pub fn trigger_nodes(&self) -> Vec<&Node> {
        self.nodes()
            .filter(|node| node.kind() == NodeKind::Trigger)
            .collect()
    }

    /// Returns the trigger node if there is exactly one.
    #[must_use]
    pub fn trigger(&self) -> Option<&Node> {
        match self.trigger_nodes().as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Returns the trigger configuration if there is exactly one trigger.
    #[must_use]
    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        match &self.trigger()?.config {
            NodeConfig::Trigger(config) => Some(config),
            _ => None,
        }
    }

    /// Returns the successors (downstream nodes) of a given node.
    pub fn successors(&self, node_id: &NodeId) -> Vec<(&Node, &Edge)> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(index, Direction::Outgoing)
            .filter_map(|edge| {
                let target = self.graph.node_weight(edge.target())?;
                Some((target, edge.weight()))
            })
            .collect()
    }

    /// Returns the node reached from `node_id` along the edge with the
    /// given branch label (`None` for unlabeled edges).
    #[must_use]
    pub fn next_node(&self, node_id: &NodeId, branch: Option<EdgeLabel>) -> Option<&NodeId> {
        let index = self.node_index_map.get(node_id)?;
        self.graph
            .edges_directed(*index, Direction::Outgoing)
            .find(|edge| edge.weight().label == branch)
            .map(|edge| &self.graph[edge.target()].id)
    }

    /// Validates the graph and returns every problem found.
    ///
    /// An empty result means the graph is well-formed. At most one cycle
    /// is reported, naming a node on it.
    #[must_use]
    pub fn validate(&self, limits: &GraphLimits) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let total = self.node_count() + self.duplicates.len();
        if total > limits.max_nodes {
            errors.push(ValidationError::TooManyNodes {
                count: total,
                max: limits.max_nodes,
            });
        }

        errors.extend(
            self.duplicates
                .iter()
                .map(|node| ValidationError::DuplicateNodeId {
                    node_id: node.id.clone(),
                }),
        );
        errors.extend(
            self.dangling
                .iter()
                .map(|edge| ValidationError::DanglingEdge {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                }),
        );

        match self.trigger_nodes().as_slice() {
            [] => errors.push(ValidationError::MissingTrigger),
            [_] => {}
            many => errors.push(ValidationError::MultipleTriggers {
                node_ids: many.iter().map(|node| node.id.clone()).collect(),
            }),
        }

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            if let Err(error) = node.config.validate() {
                errors.push(ValidationError::InvalidConfig {
                    node_id: node.id.clone(),
                    error,
                });
            }
            if node.kind() == NodeKind::Trigger
                && self
                    .graph
                    .edges_directed(index, Direction::Incoming)
                    .next()
                    .is_some()
            {
                errors.push(ValidationError::TriggerHasIncomingEdge {
                    node_id: node.id.clone(),
                });
            }
            self.check_outgoing(index, &mut errors);
        }

        if let Some(node_id) = self.find_cycle() {
            errors.push(ValidationError::CycleDetected { node_id });
        }

        errors
    }

    fn check_outgoing(&self, index: NodeIndex, errors: &mut Vec<ValidationError>) {
        let node = &self.graph[index];
        let labels: Vec<Option<EdgeLabel>> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .map(|edge| edge.weight().label)
            .collect();

        if node.kind() == NodeKind::Condition {
            for branch in [EdgeLabel::True, EdgeLabel::False] {
                match labels.iter().filter(|l| **l == Some(branch)).count() {
                    0 => errors.push(ValidationError::MissingBranch {
                        node_id: node.id.clone(),
                        branch,
                    }),
                    1 => {}
                    _ => errors.push(ValidationError::DuplicateBranch {
                        node_id: node.id.clone(),
                        branch,
                    }),
                }
            }
            if labels.iter().any(Option::is_none) {
                errors.push(ValidationError::UnlabeledBranch {
                    node_id: node.id.clone(),
                });
            }
            return;
        }

        if labels.iter().any(Option::is_some) {
            errors.push(ValidationError::UnexpectedBranchLabel {
                node_id: node.id.clone(),
            });
        }
        if labels.len() > 1 {
            errors.push(ValidationError::TooManyOutgoingEdges {
                node_id: node.id.clone(),
                count: labels.len(),
            });
        }
    }

    /// Looks for a cycle reachable from a trigger node.
    ///
    /// Returns the target of the first back edge found, which lies on the
    /// cycle.
    #[must_use]
    pub fn find_cycle(&self) -> Option<NodeId> {
        let starts: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&index| self.graph[index].kind() == NodeKind::Trigger)
            .collect();

        let found = depth_first_search(&self.graph, starts, |event| match event {
            DfsEvent::BackEdge(_, target) => Control::Break(target),
            _ => Control::Continue,
        });
        found.break_value().map(|index| self.graph[index].id.clone())
    }
}

impl Default for WorkflowGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Stored representation of a graph.
#[derive(Serialize, Deserialize)]
struct GraphDocument {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<EdgeRef>,
}

impl From<GraphDocument> for WorkflowGraph {
    fn from(document: GraphDocument) -> Self {
        let mut graph = Self::new();
        for node in document.nodes {
            graph.add_node(node);
        }
        for edge in document.edges {
            let endpoints = (
                graph.node_index_map.get(&edge.source),
                graph.node_index_map.get(&edge.target),
            );
            match endpoints {
                (Some(&source), Some(&target)) => {
                    graph.graph.add_edge(source, target, Edge { label: edge.label });
                }
                _ => graph.dangling.push(edge),
            }
        }
        graph
    }
}

impl From<WorkflowGraph> for GraphDocument {
    fn from(graph: WorkflowGraph) -> Self {
        let mut edges = graph.edges();
        edges.extend(graph.dangling);
        let mut nodes: Vec<Node> = graph.graph.node_weights().cloned().collect();
        nodes.extend(graph.duplicates);
        Self { nodes, edges }
    }
}
