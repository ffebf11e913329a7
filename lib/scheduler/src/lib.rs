//! Scheduler and runner for workflow executions.
//!
//! This crate provides:
//!
//! - **Engine configuration**: limits, timeouts and pool sizes loaded from the environment
//! - **Leases**: at most one active driver per execution, process-local or
//!   shared through a NATS key-value bucket
//! - **Scheduler**: submit, drive, resume, cancel and status, plus the resume poller

pub mod config;
pub mod error;
pub mod lease;
pub mod nats;
pub mod scheduler;

pub use config::{DefaultPlan, EngineConfig, PlanLookup, PlanTier};
pub use error::{LeaseError, SchedulerError};
pub use lease::{InMemoryLeaseManager, Lease, LeaseManager};
pub use nats::NatsLeaseManager;
pub use scheduler::{Scheduler, SchedulerBuilder};
