//! Workflow execution state machine.
//!
//! An execution is one run of one definition version for one event. It is
//! the unit of checkpointing: after every step the whole record is
//! persisted, so any worker can resume it.
//!
//! ```text
//! Running -> Waiting -> Running -> ... -> Completed | Failed | TimedOut | Cancelled
//! ```

use crate::context::ExecutionContext;
use crate::definition::WorkflowDefinition;
use crate::error::ValidationError;
use crate::node::NodeId;
use crate::trigger::Event;
use autoflow_core::{EventId, ExecutionId, OrganizationId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// The overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// A worker is stepping through nodes.
    Running,
    /// Suspended until `resume_at`.
    Waiting,
    /// Reached a node with no outgoing edge.
    Completed,
    /// Stopped on an error.
    Failed,
    /// Exceeded the run deadline.
    TimedOut,
    /// Stopped on request.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Classification of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The definition is malformed.
    Validation,
    /// The run visited more nodes than the definition has.
    CycleDetected,
    /// The run deadline passed.
    Timeout,
    /// A side effect failed and its policy gave up.
    ActionFailed,
    /// A node configuration is unusable at run time.
    Config,
    /// Another worker holds the execution.
    LeaseConflict,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::CycleDetected => "cycle_detected",
            Self::Timeout => "timeout",
            Self::ActionFailed => "action_failed",
            Self::Config => "config",
            Self::LeaseConflict => "lease_conflict",
        };
        f.write_str(name)
    }
}

/// Why a run stopped, as shown to the organization.
///
/// Messages are normalized: they never carry raw provider error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Failure class.
    pub kind: ErrorKind,
    /// Normalized message.
    pub message: String,
}

/// Why a run is suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitReason {
    /// A delay node is waiting out its duration.
    Delay { node_id: NodeId },
    /// A failed side effect is backing off before its next attempt.
    RetryBackoff { node_id: NodeId, attempt: u32 },
}

/// Retry bookkeeping for the node currently being retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Node being retried.
    pub node_id: NodeId,
    /// Attempts that have failed so far.
    pub failed_attempts: u32,
}

/// Returned when a visit would exceed the path bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathBoundExceeded {
    /// The bound that was hit.
    pub capacity: usize,
}

/// Ordered list of visited nodes, bounded by the definition's node count.
///
/// An acyclic walk can never visit more nodes than exist; hitting the
/// bound means the run is looping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitedPath {
    nodes: Vec<NodeId>,
    capacity: usize,
}

impl VisitedPath {
    /// Creates an empty path with the given bound.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a visit.
    ///
    /// # Errors
    ///
    /// Returns `PathBoundExceeded` if the path is already full.
    pub fn push(&mut self, node_id: NodeId) -> Result<(), PathBoundExceeded> {
        if self.is_full() {
            return Err(PathBoundExceeded {
                capacity: self.capacity,
            });
        }
        self.nodes.push(node_id);
        Ok(())
    }

    /// Returns true if no further visit fits.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    /// Number of visits so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing was visited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The path bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Visited node ids in order.
    #[must_use]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.nodes
    }
}

/// A single run of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier for this run.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The definition version pinned at start.
    pub workflow_version: u32,
    /// Owning organization.
    pub organization_id: OrganizationId,
    /// The event that started the run.
    pub event_id: EventId,
    /// Current status.
    pub status: ExecutionStatus,
    /// Node to run next, `None` once the walk has ended.
    pub current_node: Option<NodeId>,
    /// Run-scoped key/value store.
    pub context: ExecutionContext,
    /// Nodes visited so far.
    pub path: VisitedPath,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock deadline for the whole run.
    pub deadline: DateTime<Utc>,
    /// When a waiting run becomes due.
    pub resume_at: Option<DateTime<Utc>>,
    /// Why the run is waiting.
    pub wait_reason: Option<WaitReason>,
    /// Retry bookkeeping for the current node.
    pub retry: Option<RetryState>,
    /// Set once cancellation has been requested.
    pub cancel_requested: bool,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure details for `Failed` and `TimedOut` runs.
    pub error: Option<ExecutionFailure>,
    /// Number of checkpoints written.
    pub checkpoint_seq: u64,
}

impl Execution {
    /// Creates a run for an event, positioned on the node after the trigger.
    ///
    /// The trigger counts as the first visited node. A trigger with no
    /// outgoing edge yields a run that is already completed.
    ///
    /// # Errors
    ///
    /// Returns `MissingTrigger` if the definition has no single trigger.
    pub fn start(
        definition: &WorkflowDefinition,
        event: &Event,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let trigger = definition
            .graph
            .trigger()
            .ok_or(ValidationError::MissingTrigger)?;
        let mut path = VisitedPath::with_capacity(definition.graph.node_count());
        path.push(trigger.id.clone())
            .map_err(|_| ValidationError::MissingTrigger)?;
        let current_node = definition.graph.next_node(&trigger.id, None).cloned();

        let mut execution = Self {
            id: ExecutionId::new(),
            workflow_id: definition.id,
            workflow_version: definition.version,
            organization_id: definition.organization_id,
            event_id: event.id,
            status: ExecutionStatus::Running,
            current_node,
            context: ExecutionContext::seed(event),
            path,
            started_at: now,
            deadline,
            resume_at: None,
            wait_reason: None,
            retry: None,
            cancel_requested: false,
            finished_at: None,
            error: None,
            checkpoint_seq: 0,
        };
        if execution.current_node.is_none() {
            execution.complete(now);
        }
        Ok(execution)
    }

    /// Returns true if the run is waiting and its resume time has passed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Waiting && self.resume_at.is_some_and(|at| at <= now)
    }

    /// Suspends the run until `resume_at`.
    pub fn wait_until(&mut self, resume_at: DateTime<Utc>, reason: WaitReason) {
        self.status = ExecutionStatus::Waiting;
        self.resume_at = Some(resume_at);
        self.wait_reason = Some(reason);
    }

    /// Puts a waiting run back into `Running`.
    pub fn resume(&mut self) {
        self.status = ExecutionStatus::Running;
        self.resume_at = None;
        self.wait_reason = None;
    }

    /// Marks the run as completed.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.finish(ExecutionStatus::Completed, None, now);
    }

    /// Marks the run as failed.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>, now: DateTime<Utc>) {
        let failure = ExecutionFailure {
            kind,
            message: message.into(),
        };
        self.finish(ExecutionStatus::Failed, Some(failure), now);
    }

    /// Marks the run as timed out.
    pub fn time_out(&mut self, now: DateTime<Utc>) {
        let failure = ExecutionFailure {
            kind: ErrorKind::Timeout,
            message: format!("run exceeded its deadline of {}", self.deadline.to_rfc3339()),
        };
        self.finish(ExecutionStatus::TimedOut, Some(failure), now);
    }

    /// Marks the run as cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.cancel_requested = true;
        self.finish(ExecutionStatus::Cancelled, None, now);
    }

    fn finish(&mut self, status: ExecutionStatus, error: Option<ExecutionFailure>, now: DateTime<Utc>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.resume_at = None;
        self.wait_reason = None;
        self.retry = None;
    }

    /// Bumps the checkpoint sequence before a save.
    pub fn record_checkpoint(&mut self) {
        self.checkpoint_seq += 1;
    }

    /// Returns a read-only view for status queries.
    #[must_use]
    pub fn view(&self) -> ExecutionView {
        ExecutionView {
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_version: self.workflow_version,
            organization_id: self.organization_id,
            status: self.status,
            current_node: self.current_node.clone(),
            path: self.path.as_slice().to_vec(),
            context: self.context.snapshot(),
            error: self.error.clone(),
            started_at: self.started_at,
            resume_at: self.resume_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only snapshot of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionView {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub organization_id: OrganizationId,
    pub status: ExecutionStatus,
    pub current_node: Option<NodeId>,
    pub path: Vec<NodeId>,
    pub context: BTreeMap<String, JsonValue>,
    pub error: Option<ExecutionFailure>,
    pub started_at: DateTime<Utc>,
    pub resume_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
