//! Error types for the scheduler crate.
//!
//! Public scheduler operations return `rootcause::Report<SchedulerError>`;
//! lower layers map their errors into a variant with `?`.

use autoflow_core::{ExecutionId, WorkflowId};
use autoflow_workflow::{ExecutionStatus, StoreError, ValidationError};
use chrono::{DateTime, Utc};
use std::fmt;

/// Errors from lease operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// Another driver holds an unexpired lease.
    Held {
        execution_id: ExecutionId,
        holder: String,
    },
    /// The lease expired and was taken over or released.
    Lost { execution_id: ExecutionId },
    /// The lease backend could not be reached.
    Backend {
        execution_id: ExecutionId,
        reason: String,
    },
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held {
                execution_id,
                holder,
            } => write!(f, "execution {execution_id} is leased by {holder}"),
            Self::Lost { execution_id } => write!(f, "lease on execution {execution_id} was lost"),
            Self::Backend {
                execution_id,
                reason,
            } => write!(f, "lease on execution {execution_id} unavailable: {reason}"),
        }
    }
}

impl std::error::Error for LeaseError {}

/// High-level scheduler errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Another driver owns the execution; retry later.
    LeaseConflict { execution_id: ExecutionId },
    /// Resume was called before the run's resume time.
    NotDue {
        execution_id: ExecutionId,
        resume_at: Option<DateTime<Utc>>,
    },
    /// The execution or its definition version does not exist.
    NotFound { entity: &'static str, id: String },
    /// The execution already reached a terminal status.
    AlreadyTerminal {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// A definition could not start a run.
    InvalidDefinition {
        workflow_id: WorkflowId,
        errors: Vec<ValidationError>,
    },
    /// A store operation failed.
    Store { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeaseConflict { execution_id } => {
                write!(f, "execution {execution_id} is being driven elsewhere")
            }
            Self::NotDue {
                execution_id,
                resume_at,
            } => match resume_at {
                Some(at) => write!(
                    f,
                    "execution {execution_id} is not due until {}",
                    at.to_rfc3339()
                ),
                None => write!(f, "execution {execution_id} is not waiting"),
            },
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::AlreadyTerminal {
                execution_id,
                status,
            } => write!(f, "execution {execution_id} already {status}"),
            Self::InvalidDefinition {
                workflow_id,
                errors,
            } => {
                write!(f, "workflow {workflow_id} is invalid")?;
                if let Some(first) = errors.first() {
                    write!(f, ": {first}")?;
                    if errors.len() > 1 {
                        write!(f, " (and {} more)", errors.len() - 1)?;
                    }
                }
                Ok(())
            }
            Self::Store { reason } => write!(f, "store operation failed: {reason}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StoreError> for SchedulerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Store {
                reason: other.to_string(),
            },
        }
    }
}

impl From<LeaseError> for SchedulerError {
    fn from(error: LeaseError) -> Self {
        match error {
            LeaseError::Held { execution_id, .. } | LeaseError::Lost { execution_id } => {
                Self::LeaseConflict { execution_id }
            }
            backend @ LeaseError::Backend { .. } => Self::Store {
                reason: backend.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_error_display() {
        let id = ExecutionId::new();
        let err = LeaseError::Held {
            execution_id: id,
            holder: "worker_a".to_string(),
        };
        assert!(err.to_string().contains("leased by worker_a"));
    }

    #[test]
    fn lease_errors_become_conflicts() {
        let id = ExecutionId::new();
        let err = SchedulerError::from(LeaseError::Lost { execution_id: id });
        assert_eq!(err, SchedulerError::LeaseConflict { execution_id: id });
    }

    #[test]
    fn lease_backend_failures_are_store_errors() {
        let err = SchedulerError::from(LeaseError::Backend {
            execution_id: ExecutionId::new(),
            reason: "timed out".to_string(),
        });
        assert!(matches!(err, SchedulerError::Store { ref reason } if reason.ends_with("timed out")));
    }

    #[test]
    fn store_not_found_is_preserved() {
        let err = SchedulerError::from(StoreError::NotFound {
            entity: "execution",
            id: "exec_1".to_string(),
        });
        assert_eq!(err.to_string(), "execution not found: exec_1");
    }

    #[test]
    fn invalid_definition_summarizes_errors() {
        let err = SchedulerError::InvalidDefinition {
            workflow_id: WorkflowId::new(),
            errors: vec![
                ValidationError::MissingTrigger,
                ValidationError::TooManyNodes { count: 101, max: 100 },
            ],
        };
        assert!(err.to_string().contains("(and 1 more)"));
    }
}
