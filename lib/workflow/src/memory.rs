//! In-process store implementations.
//!
//! Records are kept as enveloped JSON bytes, the same encoding the NATS
//! store writes, so tests exercise the real serialization path.

use crate::definition::WorkflowDefinition;
use crate::envelope::{decode, encode};
use crate::error::StoreError;
use crate::execution::{Execution, ExecutionStatus};
use crate::graph::GraphLimits;
use crate::store::{DefinitionStore, ExecutionStore, IdempotencyStore};
use async_trait::async_trait;
use autoflow_core::{ExecutionId, OrganizationId, WorkflowId};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Definition store keeping every version in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDefinitionStore {
    limits: GraphLimits,
    versions: Arc<Mutex<HashMap<WorkflowId, BTreeMap<u32, Vec<u8>>>>>,
}

impl InMemoryDefinitionStore {
    /// Creates an empty store validating against the given limits.
    #[must_use]
    pub fn new(limits: GraphLimits) -> Self {
        Self {
            limits,
            versions: Arc::default(),
        }
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn enabled_definitions(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let latest: Vec<Vec<u8>> = lock(&self.versions)
            .values()
            .filter_map(|versions| versions.values().next_back().cloned())
            .collect();
        let mut definitions = Vec::new();
        for bytes in latest {
            let definition: WorkflowDefinition = decode(&bytes)?;
            if definition.organization_id == organization_id && definition.is_enabled() {
                definitions.push(definition);
            }
        }
        Ok(definitions)
    }

    async fn get_definition(
        &self,
        id: WorkflowId,
        version: u32,
    ) -> Result<WorkflowDefinition, StoreError> {
        let bytes = lock(&self.versions)
            .get(&id)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow definition",
                id: format!("{id}@v{version}"),
            })?;
        decode(&bytes)
    }

    async fn save_definition(&self, mut definition: WorkflowDefinition) -> Result<u32, StoreError> {
        if definition.is_enabled() {
            let errors = definition.validate(&self.limits);
            if !errors.is_empty() {
                return Err(StoreError::Rejected { errors });
            }
        }
        let mut versions = lock(&self.versions);
        let history = versions.entry(definition.id).or_default();
        let version = history.keys().next_back().map_or(1, |latest| latest + 1);
        definition.version = version;
        history.insert(version, encode(&definition)?);
        debug!(workflow_id = %definition.id, version, "definition saved");
        Ok(version)
    }
}

/// Execution store keeping only the latest checkpoint of each run.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionStore {
    checkpoints: Arc<Mutex<HashMap<ExecutionId, Vec<u8>>>>,
    waiting: Arc<Mutex<HashMap<ExecutionId, DateTime<Utc>>>>,
    running: Arc<Mutex<BTreeSet<ExecutionId>>>,
    cancellations: Arc<Mutex<HashSet<ExecutionId>>>,
}

impl InMemoryExecutionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.checkpoints).len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.checkpoints).is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_checkpoint(&self, execution: &Execution) -> Result<(), StoreError> {
        let bytes = encode(execution)?;
        lock(&self.checkpoints).insert(execution.id, bytes);
        let mut waiting = lock(&self.waiting);
        match (execution.status, execution.resume_at) {
            (ExecutionStatus::Waiting, Some(resume_at)) => {
                waiting.insert(execution.id, resume_at);
            }
            _ => {
                waiting.remove(&execution.id);
            }
        }
        let mut running = lock(&self.running);
        if execution.status == ExecutionStatus::Running {
            running.insert(execution.id);
        } else {
            running.remove(&execution.id);
        }
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        let bytes = lock(&self.checkpoints)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })?;
        decode(&bytes)
    }

    async fn list_waiting_due(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, StoreError> {
        let mut due: Vec<(DateTime<Utc>, ExecutionId)> = lock(&self.waiting)
            .iter()
            .filter(|(_, resume_at)| **resume_at <= now)
            .map(|(id, resume_at)| (*resume_at, *id))
            .collect();
        due.sort_by_key(|(resume_at, _)| *resume_at);
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_running(&self) -> Result<Vec<ExecutionId>, StoreError> {
        Ok(lock(&self.running).iter().copied().collect())
    }

    async fn request_cancellation(&self, id: ExecutionId) -> Result<(), StoreError> {
        lock(&self.cancellations).insert(id);
        Ok(())
    }

    async fn cancellation_requested(&self, id: ExecutionId) -> Result<bool, StoreError> {
        Ok(lock(&self.cancellations).contains(&id))
    }
}

/// Idempotency store backed by a map of enveloped outputs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryIdempotencyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn completed(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let bytes = lock(&self.entries).get(key).cloned();
        bytes.map(|bytes| decode(&bytes)).transpose()
    }

    async fn record(&self, key: &str, output: &JsonValue) -> Result<(), StoreError> {
        let bytes = encode(output)?;
        lock(&self.entries).insert(key.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::graph::WorkflowGraph;
    use crate::node::{DelayConfig, DelayUnit, Node, NodeConfig};
    use crate::trigger::{Event, EventType, TriggerConfig};
    use chrono::Duration;
    use serde_json::json;

    fn valid_graph() -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        graph.add_node(Node::with_id(
            "start",
            "Start",
            NodeConfig::Trigger(TriggerConfig::new(EventType::MessageReceived)),
        ));
        graph.add_node(Node::with_id(
            "wait",
            "Wait",
            NodeConfig::Delay(DelayConfig::new(1, DelayUnit::Minutes)),
        ));
        graph.add_edge("start", "wait", Edge::unlabeled()).expect("edge");
        graph
    }

    fn enabled(org: OrganizationId, graph: WorkflowGraph) -> WorkflowDefinition {
        let mut definition = WorkflowDefinition::new(org, "Flow").with_graph(graph);
        definition.metadata.enabled = true;
        definition
    }

    #[tokio::test]
    async fn save_assigns_increasing_versions() {
        let store = InMemoryDefinitionStore::default();
        let org = OrganizationId::new();
        let definition = enabled(org, valid_graph());
        let id = definition.id;

        assert_eq!(store.save_definition(definition.clone()).await.expect("v1"), 1);
        assert_eq!(store.save_definition(definition).await.expect("v2"), 2);

        let v1 = store.get_definition(id, 1).await.expect("get v1");
        assert_eq!(v1.version, 1);
        let enabled = store.enabled_definitions(org).await.expect("list");
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].version, 2);
    }

    #[tokio::test]
    async fn invalid_enabled_definitions_are_rejected() {
        let store = InMemoryDefinitionStore::default();
        let org = OrganizationId::new();
        let broken = enabled(org, WorkflowGraph::new());

        let err = store.save_definition(broken.clone()).await.expect_err("rejected");
        assert!(matches!(err, StoreError::Rejected { .. }));

        let mut draft = broken;
        draft.metadata.enabled = false;
        store.save_definition(draft).await.expect("drafts may be invalid");
        assert!(store.enabled_definitions(org).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn missing_version_is_not_found() {
        let store = InMemoryDefinitionStore::default();
        let err = store
            .get_definition(WorkflowId::new(), 1)
            .await
            .expect_err("missing");
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn checkpoints_track_waiting_runs() {
        let store = InMemoryExecutionStore::new();
        let definition = enabled(OrganizationId::new(), valid_graph());
        let now = Utc::now();
        let event = Event::new(definition.organization_id, EventType::MessageReceived, json!({}));
        let mut execution =
            Execution::start(&definition, &event, now, now + Duration::minutes(5)).expect("start");

        execution.wait_until(
            now + Duration::minutes(1),
            crate::execution::WaitReason::Delay {
                node_id: "wait".into(),
            },
        );
        store.save_checkpoint(&execution).await.expect("save");
        assert!(store.list_waiting_due(now).await.expect("list").is_empty());
        assert_eq!(
            store
                .list_waiting_due(now + Duration::minutes(1))
                .await
                .expect("list"),
            vec![execution.id]
        );

        execution.resume();
        execution.complete(now);
        store.save_checkpoint(&execution).await.expect("save");
        assert!(
            store
                .list_waiting_due(now + Duration::hours(1))
                .await
                .expect("list")
                .is_empty()
        );

        let loaded = store.load_execution(execution.id).await.expect("load");
        assert_eq!(loaded, execution);
    }

    #[tokio::test]
    async fn checkpoints_track_running_runs() {
        let store = InMemoryExecutionStore::new();
        let definition = enabled(OrganizationId::new(), valid_graph());
        let now = Utc::now();
        let event = Event::new(definition.organization_id, EventType::MessageReceived, json!({}));
        let mut execution =
            Execution::start(&definition, &event, now, now + Duration::minutes(5)).expect("start");

        store.save_checkpoint(&execution).await.expect("save");
        assert_eq!(store.list_running().await.expect("list"), vec![execution.id]);

        execution.wait_until(
            now + Duration::minutes(1),
            crate::execution::WaitReason::Delay {
                node_id: "wait".into(),
            },
        );
        store.save_checkpoint(&execution).await.expect("save");
        assert!(store.list_running().await.expect("list").is_empty());

        execution.resume();
        store.save_checkpoint(&execution).await.expect("save");
        assert_eq!(store.list_running().await.expect("list"), vec![execution.id]);

        execution.complete(now);
        store.save_checkpoint(&execution).await.expect("save");
        assert!(store.list_running().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn cancellation_registry() {
        let store = InMemoryExecutionStore::new();
        let id = ExecutionId::new();
        assert!(!store.cancellation_requested(id).await.expect("check"));
        store.request_cancellation(id).await.expect("request");
        assert!(store.cancellation_requested(id).await.expect("check"));
    }

    #[tokio::test]
    async fn idempotency_entries() {
        let store = InMemoryIdempotencyStore::new();
        assert_eq!(store.completed("exec:send").await.expect("get"), None);
        store
            .record("exec:send", &json!({ "message_id": "m1" }))
            .await
            .expect("record");
        assert_eq!(
            store.completed("exec:send").await.expect("get"),
            Some(json!({ "message_id": "m1" }))
        );
        let stored = lock(&store.entries).get("exec:send").cloned().expect("entry");
        let envelope: JsonValue = serde_json::from_slice(&stored).expect("json");
        assert_eq!(envelope["version"], json!(crate::envelope::CURRENT_VERSION));
    }
}
