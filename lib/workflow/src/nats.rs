//! NATS JetStream key-value execution store.
//!
//! One bucket holds three key families:
//!
//! - `exec.<ulid>`: the enveloped checkpoint of an execution
//! - `waiting.<ulid>`: the RFC 3339 resume time of a waiting execution
//! - `running.<ulid>`: present while the last checkpoint is `Running`
//! - `cancel.<ulid>`: present once cancellation was requested
//!
//! Both indexes are rewritten on every checkpoint, so a poller in any
//! process can find due or orphaned runs without decoding checkpoints.

use crate::envelope::{decode, encode};
use crate::error::StoreError;
use crate::execution::{Execution, ExecutionStatus};
use crate::store::ExecutionStore;
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use autoflow_core::ExecutionId;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fmt;
use tracing::{debug, warn};

/// Default bucket name for execution checkpoints.
const EXECUTIONS_BUCKET_NAME: &str = "autoflow-executions";

const EXECUTION_PREFIX: &str = "exec";
const WAITING_PREFIX: &str = "waiting";
const RUNNING_PREFIX: &str = "running";
const CANCEL_PREFIX: &str = "cancel";

/// Configuration for the NATS execution store.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Key-value bucket name (defaults to `autoflow-executions`).
    pub bucket_name: Option<String>,
}

impl NatsConfig {
    /// Creates a new config with the given NATS URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bucket_name: None,
        }
    }

    /// Overrides the bucket name.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket_name = Some(bucket.into());
        self
    }

    fn bucket(&self) -> &str {
        self.bucket_name.as_deref().unwrap_or(EXECUTIONS_BUCKET_NAME)
    }
}

fn key(prefix: &str, id: ExecutionId) -> String {
    format!("{prefix}.{}", id.key_token())
}

fn parse_key(prefix: &str, key: &str) -> Option<ExecutionId> {
    key.strip_prefix(prefix)?
        .strip_prefix('.')?
        .parse()
        .ok()
}

fn backend(context: &str, error: impl fmt::Display) -> StoreError {
    StoreError::Backend {
        message: format!("{context}: {error}"),
    }
}

/// [`ExecutionStore`] on a JetStream key-value bucket.
pub struct NatsExecutionStore {
    store: kv::Store,
}

impl NatsExecutionStore {
    /// Connects and opens the bucket, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the connection or bucket setup fails.
    pub async fn connect(config: &NatsConfig) -> Result<Self, StoreError> {
        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| backend("failed to connect", e))?;
        Self::open(jetstream::new(client), config.bucket()).await
    }

    /// Opens the bucket on an existing JetStream context.
    ///
    /// # Errors
    ///
    /// Returns `Backend` if the bucket can be neither opened nor created.
    pub async fn open(jetstream: jetstream::Context, bucket: &str) -> Result<Self, StoreError> {
        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(e) => {
                debug!(bucket, error = %e, "bucket missing, creating");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| backend("failed to create bucket", e))?
            }
        };
        Ok(Self { store })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<ExecutionId>, StoreError> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| backend("failed to list keys", e))?;
        let mut ids = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| backend("failed to read key", e))?;
            if let Some(id) = parse_key(prefix, &key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl ExecutionStore for NatsExecutionStore {
    async fn save_checkpoint(&self, execution: &Execution) -> Result<(), StoreError> {
        let bytes = encode(execution)?;
        self.store
            .put(key(EXECUTION_PREFIX, execution.id), bytes.into())
            .await
            .map_err(|e| backend("failed to write checkpoint", e))?;

        let waiting_key = key(WAITING_PREFIX, execution.id);
        match (execution.status, execution.resume_at) {
            (ExecutionStatus::Waiting, Some(resume_at)) => {
                self.store
                    .put(waiting_key, resume_at.to_rfc3339().into_bytes().into())
                    .await
                    .map_err(|e| backend("failed to index waiting run", e))?;
            }
            _ => {
                self.store
                    .delete(waiting_key)
                    .await
                    .map_err(|e| backend("failed to clear waiting index", e))?;
            }
        }

        let running_key = key(RUNNING_PREFIX, execution.id);
        if execution.status == ExecutionStatus::Running {
            self.store
                .put(running_key, execution.checkpoint_seq.to_string().into_bytes().into())
                .await
                .map_err(|e| backend("failed to index running run", e))?;
        } else {
            self.store
                .delete(running_key)
                .await
                .map_err(|e| backend("failed to clear running index", e))?;
        }
        debug!(
            execution_id = %execution.id,
            status = %execution.status,
            seq = execution.checkpoint_seq,
            "checkpoint written"
        );
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        let bytes = self
            .store
            .get(key(EXECUTION_PREFIX, id))
            .await
            .map_err(|e| backend("failed to read checkpoint", e))?
            .ok_or_else(|| StoreError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })?;
        decode(&bytes)
    }

    async fn list_waiting_due(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>, StoreError> {
        let mut due = Vec::new();
        for id in self.keys_with_prefix(WAITING_PREFIX).await? {
            let Some(value) = self
                .store
                .get(key(WAITING_PREFIX, id))
                .await
                .map_err(|e| backend("failed to read waiting index", e))?
            else {
                continue;
            };
            let parsed = std::str::from_utf8(&value)
                .ok()
                .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
                .map(|at| at.with_timezone(&Utc));
            match parsed {
                Some(resume_at) if resume_at <= now => {
                    due.push((resume_at, id));
                }
                Some(_) => {}
                None => warn!(execution_id = %id, "unreadable waiting index entry"),
            }
        }
        due.sort_by_key(|(resume_at, _)| *resume_at);
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_running(&self) -> Result<Vec<ExecutionId>, StoreError> {
        let mut running = Vec::new();
        for id in self.keys_with_prefix(RUNNING_PREFIX).await? {
            let entry = self
                .store
                .get(key(RUNNING_PREFIX, id))
                .await
                .map_err(|e| backend("failed to read running index", e))?;
            if entry.is_some() {
                running.push(id);
            }
        }
        Ok(running)
    }

    async fn request_cancellation(&self, id: ExecutionId) -> Result<(), StoreError> {
        self.store
            .put(key(CANCEL_PREFIX, id), Utc::now().to_rfc3339().into_bytes().into())
            .await
            .map_err(|e| backend("failed to record cancellation", e))?;
        Ok(())
    }

    async fn cancellation_requested(&self, id: ExecutionId) -> Result<bool, StoreError> {
        let entry = self
            .store
            .get(key(CANCEL_PREFIX, id))
            .await
            .map_err(|e| backend("failed to read cancellation", e))?;
        Ok(entry.is_some())
    }
}
