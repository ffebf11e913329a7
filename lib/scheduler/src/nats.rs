//! NATS JetStream key-value leases.
//!
//! Each execution has one key, `lease.<ulid>`, holding the holder and expiry
//! as JSON. Every write is a compare-and-swap on the entry revision, and the
//! revision doubles as the lease token, so two processes can never both
//! hold an unexpired lease on the same execution.
//!
//! Expiry is compared against each worker's own clock; worker clocks must
//! agree to well within the lease TTL.

use crate::error::LeaseError;
use crate::lease::{Lease, LeaseManager};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use autoflow_core::ExecutionId;
use autoflow_workflow::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default bucket name for execution leases.
pub const LEASES_BUCKET_NAME: &str = "autoflow-leases";

const LEASE_PREFIX: &str = "lease";

fn lease_key(id: ExecutionId) -> String {
    format!("{LEASE_PREFIX}.{}", id.key_token())
}

/// Stored value of a lease key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    fn to_bytes(&self) -> Vec<u8> {
        // A struct of a string and a timestamp always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// [`LeaseManager`] shared by every process using the same bucket.
pub struct NatsLeaseManager {
    store: kv::Store,
    clock: Arc<dyn Clock>,
}

impl NatsLeaseManager {
    /// Connects and opens the default lease bucket, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns the connection or bucket setup failure as text.
    pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> Result<Self, String> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| format!("failed to connect: {e}"))?;
        Self::open(jetstream::new(client), LEASES_BUCKET_NAME, clock).await
    }

    /// Opens a lease bucket on an existing JetStream context.
    ///
    /// # Errors
    ///
    /// Returns the failure as text if the bucket can be neither opened nor
    /// created.
    pub async fn open(
        jetstream: jetstream::Context,
        bucket: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, String> {
        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(e) => {
                debug!(bucket, error = %e, "lease bucket missing, creating");
                jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| format!("failed to create lease bucket: {e}"))?
            }
        };
        Ok(Self { store, clock })
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1))
    }

    /// Reads the current record and its revision; deleted keys read as free.
    async fn current(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<(LeaseRecord, u64)>, LeaseError> {
        let entry = self
            .store
            .entry(lease_key(execution_id))
            .await
            .map_err(|e| backend(execution_id, e))?;
        Ok(entry
            .filter(|entry| matches!(entry.operation, kv::Operation::Put))
            .map(|entry| {
                let record = LeaseRecord::from_bytes(&entry.value).unwrap_or_else(|| {
                    warn!(%execution_id, "unreadable lease record, treating as expired");
                    LeaseRecord {
                        holder: String::new(),
                        expires_at: DateTime::<Utc>::MIN_UTC,
                    }
                });
                (record, entry.revision)
            }))
    }

    /// Explains a failed compare-and-swap on acquire.
    async fn contended(&self, execution_id: ExecutionId, error: impl fmt::Display) -> LeaseError {
        match self.current(execution_id).await {
            Ok(Some((record, _))) if record.is_live(self.clock.now()) => LeaseError::Held {
                execution_id,
                holder: record.holder,
            },
            _ => backend(execution_id, error),
        }
    }

    /// Explains a failed compare-and-swap on renew.
    async fn lost_or_unavailable(
        &self,
        lease: &Lease,
        error: impl fmt::Display,
    ) -> LeaseError {
        match self.current(lease.execution_id).await {
            Ok(Some((_, revision))) if revision == lease.token => {
                backend(lease.execution_id, error)
            }
            Ok(_) => LeaseError::Lost {
                execution_id: lease.execution_id,
            },
            Err(e) => e,
        }
    }
}

fn backend(execution_id: ExecutionId, error: impl fmt::Display) -> LeaseError {
    LeaseError::Backend {
        execution_id,
        reason: error.to_string(),
    }
}

#[async_trait]
impl LeaseManager for NatsLeaseManager {
    async fn acquire(
        &self,
        execution_id: ExecutionId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LeaseError> {
        let record = LeaseRecord {
            holder: holder.to_string(),
            expires_at: self.expiry(ttl),
        };
        let key = lease_key(execution_id);
        let written = match self.current(execution_id).await? {
            Some((current, _)) if current.is_live(self.clock.now()) => {
                return Err(LeaseError::Held {
                    execution_id,
                    holder: current.holder,
                });
            }
            Some((_, revision)) => self
                .store
                .update(&key, record.to_bytes().into(), revision)
                .await
                .map_err(|e| e.to_string()),
            None => self
                .store
                .create(&key, record.to_bytes().into())
                .await
                .map_err(|e| e.to_string()),
        };
        match written {
            Ok(revision) => {
                debug!(%execution_id, holder, token = revision, "lease acquired");
                Ok(Lease {
                    execution_id,
                    holder: record.holder,
                    token: revision,
                    expires_at: record.expires_at,
                })
            }
            Err(e) => Err(self.contended(execution_id, e).await),
        }
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError> {
        let record = LeaseRecord {
            holder: lease.holder.clone(),
            expires_at: self.expiry(ttl),
        };
        match self
            .store
            .update(lease_key(lease.execution_id), record.to_bytes().into(), lease.token)
            .await
        {
            Ok(revision) => Ok(Lease {
                token: revision,
                expires_at: record.expires_at,
                ..lease.clone()
            }),
            Err(e) => Err(self.lost_or_unavailable(lease, e).await),
        }
    }

    async fn release(&self, lease: &Lease) {
        let record = LeaseRecord {
            holder: lease.holder.clone(),
            expires_at: self.clock.now(),
        };
        match self
            .store
            .update(lease_key(lease.execution_id), record.to_bytes().into(), lease.token)
            .await
        {
            Ok(_) => debug!(execution_id = %lease.execution_id, token = lease.token, "lease released"),
            Err(e) => debug!(execution_id = %lease.execution_id, error = %e, "lease already gone"),
        }
    }
}
