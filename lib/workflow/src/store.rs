//! Persistence seams.
//!
//! The engine owns no storage. Embedders plug in definition, execution and
//! idempotency stores; in-memory versions live in [`crate::memory`] and a
//! NATS key-value backed execution store in [`crate::nats`].

use crate::definition::WorkflowDefinition;
use crate::error::StoreError;
use crate::execution::Execution;
use async_trait::async_trait;
use autoflow_core::{ExecutionId, OrganizationId, WorkflowId};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Versioned storage for workflow definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Returns the latest version of every enabled definition of an organization.
    async fn enabled_definitions(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Returns a specific version of a definition.
    async fn get_definition(
        &self,
        id: WorkflowId,
        version: u32,
    ) -> Result<WorkflowDefinition, StoreError>;

    /// Saves a definition as a new version and returns the version assigned.
    ///
    /// Definitions that fail validation may only be saved disabled.
    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<u32, StoreError>;
}

/// Durable storage for execution checkpoints.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persists the full execution record, replacing the previous checkpoint.
    async fn save_checkpoint(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Loads the latest checkpoint.
    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, StoreError>;

    /// Returns waiting executions whose resume time is at or before `now`.
    async fn list_waiting_due(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, StoreError>;

    /// Returns executions whose last checkpoint is `Running`.
    ///
    /// A run is only `Running` in the store while a driver steps it, so an
    /// entry whose lease can be taken belongs to a driver that stopped.
    async fn list_running(&self) -> Result<Vec<ExecutionId>, StoreError>;

    /// Records that an execution should stop at its next step.
    async fn request_cancellation(&self, id: ExecutionId) -> Result<(), StoreError>;

    /// Returns true if cancellation was requested.
    async fn cancellation_requested(&self, id: ExecutionId) -> Result<bool, StoreError>;
}

/// Remembers the outputs of side effects that already succeeded.
///
/// Keys are derived from `(execution, node)`, so a replayed step returns
/// the recorded output instead of repeating the side effect.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the recorded output for a completed key.
    async fn completed(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;

    /// Records the output of a completed side effect.
    async fn record(&self, key: &str, output: &JsonValue) -> Result<(), StoreError>;
}
