//! Scheduler and runner.
//!
//! The scheduler turns events into executions and drives them step by step.
//! Every step is followed by a checkpoint, so a run suspended on a delay or
//! retry backoff releases its worker and any process can resume it later.
//!
//! ```text
//! submit(event) -> create_runs -> spawn drive(id) on the worker pool
//! run_resume_poller -> resume_due -> resume(id) -> drive
//!                   -> recover_stalled -> drive(id)
//! ```

use crate::config::{DefaultPlan, EngineConfig, PlanLookup};
use crate::error::SchedulerError;
use crate::lease::{InMemoryLeaseManager, Lease, LeaseManager};
use autoflow_core::{ExecutionId, Result};
use autoflow_workflow::{
    ActionDispatcher, Clock, DefinitionStore, ErrorKind, Event, Execution, ExecutionStatus,
    ExecutionStore, ExecutionView, StepInterpreter, StoreError, SystemClock, TriggerMatcher,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

struct Inner {
    config: EngineConfig,
    worker_id: String,
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    dispatcher: ActionDispatcher,
    leases: Arc<dyn LeaseManager>,
    clock: Arc<dyn Clock>,
    plans: Arc<dyn PlanLookup>,
    workers: Arc<Semaphore>,
}

/// Builder for [`Scheduler`].
#[must_use]
pub struct SchedulerBuilder {
    config: EngineConfig,
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    dispatcher: ActionDispatcher,
    leases: Option<Arc<dyn LeaseManager>>,
    clock: Arc<dyn Clock>,
    plans: Arc<dyn PlanLookup>,
    worker_id: Option<String>,
}

impl SchedulerBuilder {
    /// Uses a specific lease manager instead of a process-local one.
    pub fn with_leases(mut self, leases: Arc<dyn LeaseManager>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Uses a specific time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses a plan lookup for per-plan deadlines.
    pub fn with_plans(mut self, plans: Arc<dyn PlanLookup>) -> Self {
        self.plans = plans;
        self
    }

    /// Names this worker in leases and logs.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Builds the scheduler.
    pub fn build(self) -> Scheduler {
        let leases = self
            .leases
            .unwrap_or_else(|| Arc::new(InMemoryLeaseManager::new(self.clock.clone())));
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| format!("worker_{}", Ulid::new()));
        let workers = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                worker_id,
                definitions: self.definitions,
                executions: self.executions,
                dispatcher: self.dispatcher,
                leases,
                clock: self.clock,
                plans: self.plans,
                workers,
            }),
        }
    }
}

/// Creates, drives, resumes and cancels executions.
///
/// Cloning is cheap; clones share stores, leases and the worker pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Starts building a scheduler.
    pub fn builder(
        config: EngineConfig,
        definitions: Arc<dyn DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        dispatcher: ActionDispatcher,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            definitions,
            executions,
            dispatcher,
            leases: None,
            clock: Arc::new(SystemClock),
            plans: Arc::new(DefaultPlan),
            worker_id: None,
        }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Creates and checkpoints one execution per matching definition.
    ///
    /// Matching definitions run independently; the returned order carries
    /// no meaning.
    ///
    /// # Errors
    ///
    /// Returns `Store` if definitions cannot be listed or a run cannot be
    /// checkpointed.
    #[instrument(skip_all, fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn create_runs(&self, event: &Event) -> Result<Vec<Execution>, SchedulerError> {
        let inner = &self.inner;
        let definitions = inner
            .definitions
            .enabled_definitions(event.organization_id)
            .await
            .map_err(SchedulerError::from)?;
        let matched = TriggerMatcher::match_event(&definitions, event);
        if matched.is_empty() {
            debug!("no workflow matched");
            return Ok(Vec::new());
        }

        let plan = inner.plans.plan_tier(event.organization_id).await;
        let timeout = chrono::Duration::from_std(inner.config.run_timeout(plan))
            .unwrap_or(chrono::Duration::seconds(inner.config.run_timeout_secs as i64));

        let mut runs = Vec::with_capacity(matched.len());
        for definition in matched {
            let now = inner.clock.now();
            let Some(deadline) = now.checked_add_signed(timeout) else {
                warn!(workflow_id = %definition.id, "run deadline out of range");
                continue;
            };
            let mut execution = match Execution::start(definition, event, now, deadline) {
                Ok(execution) => execution,
                Err(e) => {
                    warn!(workflow_id = %definition.id, error = %e, "matched workflow cannot start");
                    continue;
                }
            };
            execution.record_checkpoint();
            inner
                .executions
                .save_checkpoint(&execution)
                .await
                .map_err(SchedulerError::from)?;
            info!(
                execution_id = %execution.id,
                workflow_id = %definition.id,
                version = definition.version,
                "execution created"
            );
            runs.push(execution);
        }
        Ok(runs)
    }

    /// Creates runs for an event and drives each on the worker pool.
    ///
    /// Returns the created execution ids without waiting for the runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the runs cannot be created.
    pub async fn submit(&self, event: &Event) -> Result<Vec<ExecutionId>, SchedulerError> {
        let runs = self.create_runs(event).await?;
        let ids: Vec<ExecutionId> = runs.iter().map(|run| run.id).collect();
        for id in &ids {
            self.spawn_drive(*id);
        }
        Ok(ids)
    }

    fn spawn_drive(&self, execution_id: ExecutionId) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = scheduler.inner.workers.clone().acquire_owned().await else {
                return;
            };
            if let Err(report) = scheduler.drive(execution_id).await {
                warn!(%execution_id, error = %report, "drive failed");
            }
        });
    }

    /// Steps a running execution until it is no longer `Running`.
    ///
    /// Waiting and terminal executions are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `LeaseConflict` if another driver owns the execution,
    /// `NotFound` if it does not exist, or `Store` on persistence failures.
    #[instrument(skip(self), fields(worker_id = %self.inner.worker_id))]
    pub async fn drive(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionView, SchedulerError> {
        let lease = self.acquire(execution_id).await?;
        let result = self.drive_leased(&lease).await;
        self.inner.leases.release(&lease).await;
        result
    }

    async fn drive_leased(&self, lease: &Lease) -> Result<ExecutionView, SchedulerError> {
        let execution = self.load(lease.execution_id).await?;
        self.run_leased(lease, execution).await
    }

    /// Resumes a waiting execution whose resume time has passed, then
    /// drives it.
    ///
    /// # Errors
    ///
    /// Returns `NotDue` without side effects if the run is still waiting
    /// for its resume time or not waiting at all, `AlreadyTerminal` for
    /// finished runs and `LeaseConflict` if another driver owns it.
    #[instrument(skip(self), fields(worker_id = %self.inner.worker_id))]
    pub async fn resume(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionView, SchedulerError> {
        let lease = self.acquire(execution_id).await?;
        let result = self.resume_leased(&lease).await;
        self.inner.leases.release(&lease).await;
        result
    }

    async fn resume_leased(&self, lease: &Lease) -> Result<ExecutionView, SchedulerError> {
        let execution_id = lease.execution_id;
        let mut execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal {
                execution_id,
                status: execution.status,
            }
            .into());
        }
        if !execution.is_due(self.inner.clock.now()) {
            return Err(SchedulerError::NotDue {
                execution_id,
                resume_at: execution.resume_at,
            }
            .into());
        }
        info!(wait_reason = ?execution.wait_reason, "resuming execution");
        execution.resume();
        self.run_leased(lease, execution).await
    }

    /// Requests cancellation.
    ///
    /// The request is recorded so an active driver observes it before its
    /// next step. If no driver holds the execution, it is cancelled now.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown executions or `Store` on persistence
    /// failures.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        let execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(status = %execution.status, "cancel ignored for finished run");
            return Ok(());
        }
        inner
            .executions
            .request_cancellation(execution_id)
            .await
            .map_err(SchedulerError::from)?;

        let Ok(lease) = inner
            .leases
            .acquire(execution_id, &inner.worker_id, inner.config.lease_ttl())
            .await
        else {
            info!("cancellation recorded for active driver");
            return Ok(());
        };
        let result = self.cancel_leased(&lease).await;
        inner.leases.release(&lease).await;
        result
    }

    async fn cancel_leased(&self, lease: &Lease) -> Result<(), SchedulerError> {
        let mut execution = self.load(lease.execution_id).await?;
        if !execution.status.is_terminal() {
            execution.cancel(self.inner.clock.now());
            self.checkpoint(&mut execution).await?;
            info!("execution cancelled");
        }
        Ok(())
    }

    /// Returns a read-only view of an execution.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown executions.
    pub async fn status(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionView, SchedulerError> {
        Ok(self.load(execution_id).await?.view())
    }

    /// Resumes every due waiting execution and returns how many resumed.
    ///
    /// Runs held by another driver are skipped and picked up next time.
    ///
    /// # Errors
    ///
    /// Returns `Store` if due executions cannot be listed.
    pub async fn resume_due(&self) -> Result<usize, SchedulerError> {
        let due = self
            .inner
            .executions
            .list_waiting_due(self.inner.clock.now())
            .await
            .map_err(SchedulerError::from)?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(count = due.len(), "resuming due executions");

        let resumes = due.into_iter().map(|execution_id| async move {
            let Ok(_permit) = self.inner.workers.acquire().await else {
                return None;
            };
            match self.resume(execution_id).await {
                Ok(_) => Some(()),
                Err(report) => {
                    match report.current_context() {
                        SchedulerError::LeaseConflict { .. } | SchedulerError::NotDue { .. } => {
                            debug!(%execution_id, error = %report, "resume skipped");
                        }
                        _ => warn!(%execution_id, error = %report, "resume failed"),
                    }
                    None
                }
            }
        });
        let resumed = futures::future::join_all(resumes)
            .await
            .into_iter()
            .flatten()
            .count();
        Ok(resumed)
    }

    /// Drives `Running` executions that no driver holds.
    ///
    /// Such runs were left by a driver that stopped between checkpoints or
    /// by a submit whose driver never started. Runs with a live lease are
    /// skipped. Returns how many runs were driven.
    ///
    /// # Errors
    ///
    /// Returns `Store` if running executions cannot be listed.
    pub async fn recover_stalled(&self) -> Result<usize, SchedulerError> {
        let running = self
            .inner
            .executions
            .list_running()
            .await
            .map_err(SchedulerError::from)?;
        if running.is_empty() {
            return Ok(0);
        }

        let drives = running.into_iter().map(|execution_id| async move {
            let Ok(_permit) = self.inner.workers.acquire().await else {
                return None;
            };
            match self.drive(execution_id).await {
                Ok(view) => {
                    info!(%execution_id, status = %view.status, "stalled execution recovered");
                    Some(())
                }
                Err(report) => {
                    match report.current_context() {
                        SchedulerError::LeaseConflict { .. } => {
                            debug!(%execution_id, "execution has an active driver");
                        }
                        _ => warn!(%execution_id, error = %report, "recovery failed"),
                    }
                    None
                }
            }
        });
        let recovered = futures::future::join_all(drives)
            .await
            .into_iter()
            .flatten()
            .count();
        Ok(recovered)
    }

    /// Polls for due and stalled executions until `shutdown` completes.
    pub async fn run_resume_poller(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.inner.config.resume_poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(worker_id = %self.inner.worker_id, "resume poller started");
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    if let Err(report) = self.resume_due().await {
                        error!(error = %report, "resume scan failed");
                    }
                    if let Err(report) = self.recover_stalled().await {
                        error!(error = %report, "recovery scan failed");
                    }
                }
            }
        }
        info!(worker_id = %self.inner.worker_id, "resume poller stopped");
    }

    async fn acquire(&self, execution_id: ExecutionId) -> Result<Lease, SchedulerError> {
        let inner = &self.inner;
        let lease = inner
            .leases
            .acquire(execution_id, &inner.worker_id, inner.config.lease_ttl())
            .await
            .map_err(|e| {
                debug!(error = %e, "lease unavailable");
                SchedulerError::from(e)
            })?;
        Ok(lease)
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Execution, SchedulerError> {
        let execution = self
            .inner
            .executions
            .load_execution(execution_id)
            .await
            .map_err(SchedulerError::from)?;
        Ok(execution)
    }

    async fn checkpoint(&self, execution: &mut Execution) -> Result<(), SchedulerError> {
        execution.record_checkpoint();
        self.inner
            .executions
            .save_checkpoint(execution)
            .await
            .map_err(SchedulerError::from)?;
        Ok(())
    }

    /// Steps and checkpoints until the run leaves `Running`.
    async fn run_leased(
        &self,
        lease: &Lease,
        mut execution: Execution,
    ) -> Result<ExecutionView, SchedulerError> {
        let inner = &self.inner;
        if execution.status != ExecutionStatus::Running {
            return Ok(execution.view());
        }
        let definition = match inner
            .definitions
            .get_definition(execution.workflow_id, execution.workflow_version)
            .await
        {
            Ok(definition) => definition,
            Err(StoreError::NotFound { .. }) => {
                let message = format!(
                    "workflow {} version {} is no longer available",
                    execution.workflow_id, execution.workflow_version
                );
                warn!(%message, "pinned definition missing");
                execution.fail(ErrorKind::Config, message, inner.clock.now());
                self.checkpoint(&mut execution).await?;
                return Ok(execution.view());
            }
            Err(e) => return Err(SchedulerError::from(e).into()),
        };
        let interpreter = StepInterpreter::new(
            &definition,
            &inner.dispatcher,
            inner.clock.as_ref(),
            inner.config.call_timeout(),
        );

        let mut lease = lease.clone();
        while execution.status == ExecutionStatus::Running {
            if !execution.cancel_requested
                && inner
                    .executions
                    .cancellation_requested(execution.id)
                    .await
                    .map_err(SchedulerError::from)?
            {
                execution.cancel_requested = true;
            }
            let status = interpreter.step(&mut execution).await;
            self.checkpoint(&mut execution).await?;
            debug!(%status, seq = execution.checkpoint_seq, "step checkpointed");
            if status == ExecutionStatus::Running {
                lease = inner
                    .leases
                    .renew(&lease, inner.config.lease_ttl())
                    .await
                    .map_err(SchedulerError::from)?;
            }
        }

        match (&execution.status, &execution.error) {
            (ExecutionStatus::Waiting, _) => {
                info!(resume_at = ?execution.resume_at, "execution suspended");
            }
            (status, Some(failure)) => {
                warn!(%status, kind = %failure.kind, message = %failure.message, "execution stopped");
            }
            (status, None) => info!(%status, path_len = execution.path.len(), "execution finished"),
        }
        Ok(execution.view())
    }
}
