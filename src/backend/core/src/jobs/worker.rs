//! Job worker: reserve, execute, record, throttle, repeat.
//!
//! A worker is sequential. Concurrency comes from running several workers,
//! in one process or many, against the same backend.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handlers::HandlerRegistry;
use super::job::{Job, JobContext, JobError, JobRecord};
use super::retry::{Disposition, RetryPolicy};
use super::throttle::DutyCycle;
use crate::backend::{Backend, ReserveCriteria};
use crate::clock::{Clock, SystemClock};
use crate::error::{DeferredError, ErrorCode, Result};
use crate::plugins::{Event, HookArgs, Lifecycle};
use crate::telemetry::metrics::JobMetrics;

/// Consecutive reservation failures after which the worker gives up.
pub const MAX_CONSECUTIVE_BACKEND_FAILURES: u32 = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the job worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name written to `locked_by`; generated when unset
    pub name: Option<String>,
    /// Queues to work; empty means every queue
    pub queues: Vec<String>,
    /// Lowest priority value to reserve
    pub min_priority: Option<i32>,
    /// Highest priority value to reserve
    pub max_priority: Option<i32>,
    /// Sleep between polls when the last cycle found no work
    #[serde(with = "humantime_serde")]
    pub sleep_delay: Duration,
    /// Candidates fetched per reservation attempt
    pub read_ahead: usize,
    /// How long a claim stays live before other workers may take it over
    #[serde(with = "humantime_serde")]
    pub max_run_time: Duration,
    /// Stop once a cycle finds no work
    pub exit_on_complete: bool,
    /// Fraction of wall time the worker may spend working, in (0, 1]
    pub max_duty_cycle: f64,
    /// Jobs run per work cycle
    pub work_off_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            queues: Vec::new(),
            min_priority: None,
            max_priority: None,
            sleep_delay: Duration::from_secs(5),
            read_ahead: 5,
            max_run_time: Duration::from_secs(20 * 60),
            exit_on_complete: false,
            max_duty_cycle: 1.0,
            work_off_limit: 100,
        }
    }
}

impl WorkerConfig {
    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| {
            Err(DeferredError::new(ErrorCode::InvalidConfiguration, message))
        };

        if self.read_ahead == 0 {
            return invalid("read_ahead must be at least 1".to_string());
        }
        if self.work_off_limit == 0 {
            return invalid("work_off_limit must be at least 1".to_string());
        }
        if !(self.max_duty_cycle > 0.0 && self.max_duty_cycle <= 1.0) {
            return invalid(format!(
                "max_duty_cycle must be in (0, 1], got {}",
                self.max_duty_cycle
            ));
        }
        if let (Some(min), Some(max)) = (self.min_priority, self.max_priority) {
            if min > max {
                return invalid(format!(
                    "min_priority ({}) is greater than max_priority ({})",
                    min, max
                ));
            }
        }
        if self.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return invalid("worker name must not be blank".to_string());
        }
        Ok(())
    }
}

/// `host:<hostname> pid:<pid> <suffix>`, unique per call.
pub fn default_worker_name() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("host:{} pid:{} {}", host, std::process::id(), &suffix[..8])
}

// ═══════════════════════════════════════════════════════════════════════════════
// State & Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Not started yet
    Idle,
    /// Polling and running jobs
    Running,
    /// Shutdown observed; finishing the current job
    Draining,
    /// Loop exited
    Stopped,
}

/// Statistics for the job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs that reached a recorded outcome
    pub processed: Arc<AtomicU64>,
    /// Jobs that succeeded
    pub succeeded: Arc<AtomicU64>,
    /// Jobs that failed, rescheduled or permanently
    pub failed: Arc<AtomicU64>,
    /// 1 while a job is executing
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Rescheduled | JobOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Skipped => return,
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of one reserved job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobOutcome {
    /// Ran successfully and was removed
    Succeeded,
    /// Failed and was scheduled for another attempt
    Rescheduled,
    /// Failed permanently
    Failed,
    /// A `thread` hook declined to run it; the claim is left to expire
    Skipped,
}

/// Counts returned by [`Worker::work_off`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOffResult {
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkOffResult {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle for controlling a spawned worker.
pub struct WorkerHandle {
    name: String,
    shutdown: CancellationToken,
    stats: WorkerStats,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to shut down after its current job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker loop to exit and return its result.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| DeferredError::internal(format!("worker task failed: {}", e)))?
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    backend: Arc<dyn Backend>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    policy: RetryPolicy,
    lifecycle: Arc<Lifecycle>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl WorkerBuilder {
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use an externally owned shutdown token.
    pub fn shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Validate the configuration and build the worker.
    pub fn build(self) -> Result<Worker> {
        self.config.validate()?;
        let name = self
            .config
            .name
            .clone()
            .unwrap_or_else(default_worker_name);
        let (state, _) = watch::channel(WorkerState::Idle);

        Ok(Worker {
            name,
            throttle: DutyCycle::new(self.config.max_duty_cycle),
            config: self.config,
            policy: self.policy,
            backend: self.backend,
            handlers: self.handlers,
            lifecycle: self.lifecycle,
            clock: self.clock,
            shutdown: self.shutdown,
            stats: WorkerStats::new(),
            state,
            consecutive_failures: 0,
        })
    }
}

/// Job worker that reserves and runs jobs from a backend.
pub struct Worker {
    name: String,
    config: WorkerConfig,
    policy: RetryPolicy,
    backend: Arc<dyn Backend>,
    handlers: Arc<HandlerRegistry>,
    lifecycle: Arc<Lifecycle>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    stats: WorkerStats,
    state: watch::Sender<WorkerState>,
    consecutive_failures: u32,
    throttle: DutyCycle,
}

impl Worker {
    /// Start building a worker for `backend` that runs jobs from `handlers`.
    pub fn builder(backend: Arc<dyn Backend>, handlers: Arc<HandlerRegistry>) -> WorkerBuilder {
        WorkerBuilder {
            backend,
            handlers,
            config: WorkerConfig::default(),
            policy: RetryPolicy::default(),
            lifecycle: Arc::new(Lifecycle::new()),
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Token that stops this worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run the worker loop on a new task.
    pub fn spawn(self) -> WorkerHandle {
        let handle_name = self.name.clone();
        let shutdown = self.shutdown.clone();
        let stats = self.stats.clone();
        let state = self.state.subscribe();

        let task = tokio::spawn(async move {
            let mut worker = self;
            worker.start().await
        });

        WorkerHandle {
            name: handle_name,
            shutdown,
            stats,
            state,
            task,
        }
    }

    /// Run work cycles until shutdown, an empty queue with `exit_on_complete`,
    /// or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the fatal backend error after too many consecutive reservation
    /// failures, or the abort error raised by a job.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker = %self.name,
            queues = ?self.config.queues,
            min_priority = ?self.config.min_priority,
            max_priority = ?self.config.max_priority,
            "Starting job worker"
        );
        self.set_state(WorkerState::Running);

        let result = self.run_loop().await;
        self.set_state(WorkerState::Stopped);

        match &result {
            Ok(()) => info!(worker = %self.name, "Exiting"),
            Err(error) => {
                error.log();
                error!(worker = %self.name, error = %error, "Worker terminated");
            }
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut at_least = Duration::ZERO;

        loop {
            let idle = self.throttle.idle_time(Instant::now(), at_least);
            if !idle.is_zero() && !self.interruptible_sleep(idle).await {
                self.set_state(WorkerState::Draining);
                return Ok(());
            }
            if self.shutdown.is_cancelled() {
                self.set_state(WorkerState::Draining);
                return Ok(());
            }

            let started = Instant::now();
            let result = self.work_off(self.config.work_off_limit).await?;
            let finished = Instant::now();
            self.throttle.record(started, finished);

            let count = result.total();
            if count == 0 {
                if self.config.exit_on_complete {
                    info!(worker = %self.name, "No more jobs available. Exiting");
                    self.set_state(WorkerState::Draining);
                    return Ok(());
                }
                at_least = self.config.sleep_delay;
            } else {
                at_least = Duration::ZERO;
                let elapsed = finished.saturating_duration_since(started).as_secs_f64();
                let rate = if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 };
                info!(
                    worker = %self.name,
                    succeeded = result.succeeded,
                    failed = result.failed,
                    "{} jobs processed at {:.4} j/s, {} failed",
                    count,
                    rate,
                    result.failed
                );
            }
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    /// Returns false when interrupted.
    async fn interruptible_sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Reserve and run up to `limit` jobs, stopping early when no job is
    /// available or shutdown is requested.
    pub async fn work_off(&mut self, limit: usize) -> Result<WorkOffResult> {
        let mut result = WorkOffResult::default();

        for _ in 0..limit {
            if self.shutdown.is_cancelled() {
                self.set_state(WorkerState::Draining);
                break;
            }
            let Some(job) = self.reserve_job().await? else {
                break;
            };
            match self.run_job(job).await? {
                JobOutcome::Succeeded => result.succeeded += 1,
                JobOutcome::Rescheduled | JobOutcome::Failed => result.failed += 1,
                JobOutcome::Skipped => {}
            }
        }

        Ok(result)
    }

    fn criteria(&self) -> ReserveCriteria {
        ReserveCriteria {
            worker: self.name.clone(),
            queues: self.config.queues.clone(),
            min_priority: self.config.min_priority,
            max_priority: self.config.max_priority,
            max_run_time: self.config.max_run_time,
            read_ahead: self.config.read_ahead,
            now: self.clock.now(),
        }
    }

    async fn reserve_job(&mut self) -> Result<Option<JobRecord>> {
        let criteria = self.criteria();
        let mut reserved = None;

        let result = {
            let slot = &mut reserved;
            let backend = &self.backend;
            let criteria = &criteria;
            self.lifecycle
                .run(Event::Reserve, HookArgs::worker(&self.name), move || async move {
                    backend.reserve(criteria).await.map(|job| *slot = job)
                })
                .await
        };

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(reserved)
            }
            Err(error) if error.is_worker_abort() => Err(error),
            Err(error) => {
                JobMetrics::reservation_failure();
                warn!(worker = %self.name, error = %error, "Error while reserving job");

                if let Err(recover_error) = self.backend.recover_from(&error).await {
                    warn!(
                        worker = %self.name,
                        error = %recover_error,
                        "Backend recovery failed"
                    );
                }

                self.consecutive_failures += 1;
                if self.consecutive_failures >= MAX_CONSECUTIVE_BACKEND_FAILURES {
                    return Err(DeferredError::fatal_backend(self.consecutive_failures, &error));
                }
                Ok(None)
            }
        }
    }

    async fn run_job(&self, job: JobRecord) -> Result<JobOutcome> {
        let started = Instant::now();
        let mut outcome = None;
        self.stats.active.store(1, Ordering::Relaxed);

        let result = {
            let slot = &mut outcome;
            let record = &job;
            self.lifecycle
                .run(Event::Thread, HookArgs::job(&self.name, &job), move || async move {
                    self.perform(record, started)
                        .await
                        .map(|outcome| *slot = Some(outcome))
                })
                .await
        };

        self.stats.active.store(0, Ordering::Relaxed);

        let outcome = match (result, outcome) {
            (Err(error), _) if error.is_worker_abort() => return Err(error),
            (Ok(()), Some(outcome)) => outcome,
            (Ok(()), None) => {
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    "{} skipped by a thread hook",
                    job.label()
                );
                JobOutcome::Skipped
            }
            (Err(error), Some(outcome)) => {
                warn!(
                    worker = %self.name,
                    job_id = %job.id,
                    error = %error,
                    "Thread hook failed after {} was recorded",
                    job.label()
                );
                outcome
            }
            (Err(error), None) => {
                self.handle_failed_job(&job, None, JobError::from(error), started)
                    .await
            }
        };

        self.stats.record(outcome);
        Ok(outcome)
    }

    async fn perform(&self, job: &JobRecord, started: Instant) -> Result<JobOutcome> {
        let payload = match self.handlers.decode(job) {
            Ok(payload) => payload,
            Err(error) => {
                return Ok(self
                    .handle_failed_job(job, None, JobError::from(error), started)
                    .await)
            }
        };

        info!(
            worker = %self.name,
            job_id = %job.id,
            job_name = %job.handler,
            queue = job.queue.as_deref().unwrap_or(""),
            attempts = job.attempts,
            "{} RUNNING",
            job.label()
        );

        let ctx = JobContext::new(job.clone(), self.name.clone(), self.shutdown.clone());
        let result = {
            let runnable = payload.as_ref();
            let ctx = &ctx;
            self.lifecycle
                .run(Event::Execute, HookArgs::job(&self.name, job), move || async move {
                    runnable.perform(ctx).await.map_err(DeferredError::from)
                })
                .await
        };

        match result {
            Ok(()) => {
                if let Err(error) = self.backend.destroy(job).await {
                    error.log();
                    error!(
                        worker = %self.name,
                        job_id = %job.id,
                        error = %error,
                        "{} COMPLETED but could not be removed; it will run again once its lock expires",
                        job.label()
                    );
                }
                let runtime = started.elapsed();
                JobMetrics::succeeded(&job.handler, runtime);
                info!(
                    worker = %self.name,
                    job_id = %job.id,
                    job_name = %job.handler,
                    "{} COMPLETED after {:.4}",
                    job.label(),
                    runtime.as_secs_f64()
                );
                Ok(JobOutcome::Succeeded)
            }
            Err(error) if error.is_worker_abort() => {
                error!(
                    worker = %self.name,
                    job_id = %job.id,
                    error = %error,
                    "{} aborted the worker",
                    job.label()
                );
                Err(error)
            }
            Err(error) => Ok(self
                .handle_failed_job(job, Some(payload.as_ref()), JobError::from(error), started)
                .await),
        }
    }

    /// Apply the retry policy to a failed job and persist the result inside
    /// the `error` or `failure` event.
    async fn handle_failed_job(
        &self,
        job: &JobRecord,
        payload: Option<&dyn Job>,
        error: JobError,
        started: Instant,
    ) -> JobOutcome {
        let now = self.clock.now();
        let disposition = self.policy.decide(job, payload, &error, now);
        let mut updated = job.clone();
        disposition.apply(&mut updated, now);

        let (event, outcome, destroy) = match &disposition {
            Disposition::Reschedule { .. } => (Event::Error, JobOutcome::Rescheduled, false),
            Disposition::Fail { destroy, .. } => (Event::Failure, JobOutcome::Failed, *destroy),
        };

        let result = {
            let backend = &self.backend;
            let record = &updated;
            self.lifecycle
                .run(
                    event,
                    HookArgs::failure(&self.name, &updated, &error),
                    move || async move {
                        if destroy {
                            backend.destroy(record).await
                        } else {
                            backend.update(record).await
                        }
                    },
                )
                .await
        };

        JobMetrics::failed(&job.handler, disposition.is_terminal(), started.elapsed());

        match &disposition {
            Disposition::Reschedule { run_at, attempts, .. } => warn!(
                worker = %self.name,
                job_id = %job.id,
                job_name = %job.handler,
                attempts = attempts,
                "{} FAILED (attempt {}) with {}; retrying at {}",
                job.label(),
                attempts,
                error,
                run_at
            ),
            Disposition::Fail { attempts, .. } if error.is_retryable() => error!(
                worker = %self.name,
                job_id = %job.id,
                job_name = %job.handler,
                attempts = attempts,
                "{} REMOVED permanently because of {} consecutive failures: {}",
                job.label(),
                attempts,
                error
            ),
            Disposition::Fail { attempts, .. } => error!(
                worker = %self.name,
                job_id = %job.id,
                job_name = %job.handler,
                attempts = attempts,
                "{} FAILED permanently: {}",
                job.label(),
                error
            ),
        }

        if let Err(record_error) = result {
            record_error.log();
            error!(
                worker = %self.name,
                job_id = %job.id,
                error = %record_error,
                "Could not record the outcome of {}; it will run again once its lock expires",
                job.label()
            );
        } else {
            debug!(worker = %self.name, job_id = %job.id, event = %event, "Recorded job failure");
        }

        outcome
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
