//! Execution leases.
//!
//! A driver must hold the lease for an execution before stepping it. Leases
//! expire after a TTL so a crashed worker's runs can be taken over.

use crate::error::LeaseError;
use async_trait::async_trait;
use autoflow_core::ExecutionId;
use autoflow_workflow::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Proof of exclusive ownership of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The leased execution.
    pub execution_id: ExecutionId,
    /// Who holds it.
    pub holder: String,
    /// Distinguishes successive leases on the same execution.
    pub token: u64,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
}

/// Grants at most one unexpired lease per execution.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Takes the lease if it is free or expired.
    async fn acquire(
        &self,
        execution_id: ExecutionId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LeaseError>;

    /// Extends a lease still held by its owner.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError>;

    /// Gives the lease up. Releasing a lost lease is a no-op.
    async fn release(&self, lease: &Lease);
}

/// Process-local lease manager.
pub struct InMemoryLeaseManager {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<ExecutionId, Lease>>,
    next_token: AtomicU64,
}

impl InMemoryLeaseManager {
    /// Creates a manager that reads expiry against `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1))
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn acquire(
        &self,
        execution_id: ExecutionId,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, LeaseError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = leases.get(&execution_id)
            && current.expires_at > now
        {
            return Err(LeaseError::Held {
                execution_id,
                holder: current.holder.clone(),
            });
        }
        let lease = Lease {
            execution_id,
            holder: holder.to_string(),
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
            expires_at: self.expiry(ttl),
        };
        debug!(%execution_id, holder, token = lease.token, "lease acquired");
        leases.insert(execution_id, lease.clone());
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(&lease.execution_id) {
            Some(current) if current.token == lease.token => {
                current.expires_at = self.expiry(ttl);
                Ok(current.clone())
            }
            _ => Err(LeaseError::Lost {
                execution_id: lease.execution_id,
            }),
        }
    }

    async fn release(&self, lease: &Lease) {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases
            .get(&lease.execution_id)
            .is_some_and(|current| current.token == lease.token)
        {
            leases.remove(&lease.execution_id);
            debug!(execution_id = %lease.execution_id, token = lease.token, "lease released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoflow_workflow::ManualClock;

    const TTL: Duration = Duration::from_secs(60);

    fn manager() -> (ManualClock, InMemoryLeaseManager) {
        let clock = ManualClock::default();
        let manager = InMemoryLeaseManager::new(Arc::new(clock.clone()));
        (clock, manager)
    }

    #[tokio::test]
    async fn second_acquire_conflicts_until_release() {
        let (_, leases) = manager();
        let id = ExecutionId::new();

        let lease = leases.acquire(id, "worker_a", TTL).await.expect("acquire");
        let err = leases.acquire(id, "worker_b", TTL).await.expect_err("held");
        assert_eq!(
            err,
            LeaseError::Held {
                execution_id: id,
                holder: "worker_a".to_string()
            }
        );

        leases.release(&lease).await;
        leases.acquire(id, "worker_b", TTL).await.expect("free again");
    }

    #[tokio::test]
    async fn same_holder_cannot_double_acquire() {
        let (_, leases) = manager();
        let id = ExecutionId::new();
        leases.acquire(id, "worker_a", TTL).await.expect("acquire");
        assert!(leases.acquire(id, "worker_a", TTL).await.is_err());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (clock, leases) = manager();
        let id = ExecutionId::new();
        let stale = leases.acquire(id, "worker_a", TTL).await.expect("acquire");

        clock.advance(chrono::Duration::seconds(61));
        let fresh = leases.acquire(id, "worker_b", TTL).await.expect("takeover");
        assert_ne!(stale.token, fresh.token);

        assert_eq!(
            leases.renew(&stale, TTL).await,
            Err(LeaseError::Lost { execution_id: id })
        );
        leases.release(&stale).await;
        assert!(leases.acquire(id, "worker_c", TTL).await.is_err());
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let (clock, leases) = manager();
        let id = ExecutionId::new();
        let lease = leases.acquire(id, "worker_a", TTL).await.expect("acquire");

        clock.advance(chrono::Duration::seconds(50));
        let renewed = leases.renew(&lease, TTL).await.expect("renew");
        assert!(renewed.expires_at > lease.expires_at);

        clock.advance(chrono::Duration::seconds(50));
        assert!(leases.acquire(id, "worker_b", TTL).await.is_err());
    }
}
