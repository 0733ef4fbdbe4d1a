//! Job definitions and traits.
//!
//! This module provides the core abstractions for deferred work:
//!
//! - **JobRecord**: The persisted unit of work that workers reserve and run
//! - **Job trait**: The executable payload behind a record
//! - **NamedJob**: A `Job` that can be serialized into a record and decoded back
//! - **JobError**: Failure returned from a job body, classified for the retry policy
//! - **JobContext**: Context passed to jobs during execution

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{DeferredError, ErrorCode};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier assigned by the backend when a record is inserted.
///
/// Ids are ordered; the reservation protocol uses them as the final tie-break.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Id carried by a record that has not been persisted yet.
    pub const UNSAVED: JobId = JobId(0);

    pub fn is_persisted(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A persisted unit of deferred work.
///
/// Invariants maintained by the worker and the retry policy:
///
/// - `locked_at` set means `locked_by` owns the record until it is released or
///   its claim goes stale (`now - locked_at > max_run_time`).
/// - `failed_at` set means the record is terminal and never reserved again.
/// - `attempts` grows by exactly one per failed execution.
/// - `run_at` only moves forward, and only through a retry-scheduling write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Lower is more urgent.
    pub priority: i32,
    pub attempts: u32,
    pub queue: Option<String>,
    /// Name the handler registry decodes `payload` with.
    pub handler: String,
    pub payload: serde_json::Value,
    /// Earliest time the record may be reserved.
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Per-record override of the policy's `max_attempts`.
    pub max_attempts: Option<u32>,
    /// Per-record override of the worker's `max_run_time` for stale-claim checks.
    #[serde(default, with = "humantime_serde")]
    pub max_run_time: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build an unsaved record that becomes eligible at `run_at`.
    pub fn new(
        handler: impl Into<String>,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::UNSAVED,
            priority: 0,
            attempts: 0,
            queue: None,
            handler: handler.into(),
            payload,
            run_at,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            last_error: None,
            max_attempts: None,
            max_run_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The handler name doubles as the job's display name.
    pub fn name(&self) -> &str {
        &self.handler
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Whether the current claim has outlived `max_run_time` and may be taken over.
    ///
    /// The record's own `max_run_time` wins over `default_max_run_time`.
    pub fn is_stale(&self, default_max_run_time: Duration, now: DateTime<Utc>) -> bool {
        let Some(locked_at) = self.locked_at else {
            return false;
        };
        let max_run_time = self.max_run_time.unwrap_or(default_max_run_time);
        chrono::Duration::from_std(max_run_time)
            .ok()
            .and_then(|ttl| locked_at.checked_add_signed(ttl))
            .is_some_and(|expires_at| expires_at < now)
    }

    /// Drop the current claim.
    pub fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }

    /// Label used in log lines: `Job <handler> (id=<id>) (queue=<queue>)`.
    pub fn label(&self) -> String {
        match &self.queue {
            Some(queue) => format!("Job {} (id={}) (queue={})", self.handler, self.id, queue),
            None => format!("Job {} (id={})", self.handler, self.id),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// How the worker should treat a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reschedule with backoff unless attempts are exhausted
    Retryable,
    /// Fail the record now regardless of remaining attempts
    Permanent,
    /// Leave the record alone and stop the worker
    AbortWorker,
}

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Retry classification
    pub kind: FailureKind,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Retryable,
            code: None,
        }
    }

    /// Create an error that fails the record without further retries.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Permanent,
            code: None,
        }
    }

    /// Create the abort-worker signal. The worker loop stops and the record
    /// stays locked until its claim goes stale.
    pub fn abort_worker(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::AbortWorker,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<JobError> for DeferredError {
    fn from(error: JobError) -> Self {
        let code = match error.kind {
            FailureKind::Retryable => ErrorCode::JobFailed,
            FailureKind::Permanent => ErrorCode::JobFailedPermanently,
            FailureKind::AbortWorker => ErrorCode::WorkerAborted,
        };
        DeferredError::new(code, error.message.clone()).with_source(error)
    }
}

impl From<DeferredError> for JobError {
    fn from(error: DeferredError) -> Self {
        if let Some(original) = error.job_error() {
            return original.clone();
        }

        let kind = match error.code() {
            ErrorCode::WorkerAborted => FailureKind::AbortWorker,
            ErrorCode::JobFailedPermanently
            | ErrorCode::HandlerNotFound
            | ErrorCode::DeserializationError => FailureKind::Permanent,
            _ => FailureKind::Retryable,
        };

        let mut message = error.to_string();
        let mut source = std::error::Error::source(&error);
        while let Some(cause) = source {
            message.push_str("\ncaused by: ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            message,
            kind,
            code: Some(error.code().to_string()),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", error))
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to jobs during execution.
pub struct JobContext {
    /// The reserved record being executed
    pub record: JobRecord,
    /// Name of the worker holding the claim
    pub worker: String,
    /// Worker shutdown signal
    shutdown: CancellationToken,
}

impl JobContext {
    pub fn new(record: JobRecord, worker: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self {
            record,
            worker: worker.into(),
            shutdown,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.record.id
    }

    /// The current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.record.attempts + 1
    }

    /// Whether the worker has been asked to stop.
    ///
    /// The worker never interrupts a running job; long jobs may poll this to
    /// finish early on their own terms.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.record.id,
            job_name = %self.record.handler,
            attempt = self.attempt(),
            worker = %self.worker,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.record.id,
            job_name = %self.record.handler,
            attempt = self.attempt(),
            worker = %self.worker,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// The executable payload behind a [`JobRecord`].
///
/// Every method except `perform` is an optional per-job override of the
/// worker's or queue's configured defaults.
#[async_trait]
pub trait Job: Send + Sync {
    /// Execute the job.
    ///
    /// # Errors
    ///
    /// Return [`JobError::retryable`] for transient failures that should be
    /// retried, [`JobError::permanent`] for failures that never will succeed,
    /// and [`JobError::abort_worker`] to stop the worker.
    async fn perform(&self, ctx: &JobContext) -> JobResult;

    /// Queue used when the enqueue call does not name one.
    fn queue_name(&self) -> Option<&str> {
        None
    }

    /// Priority used when the enqueue call does not set one.
    fn priority(&self) -> Option<i32> {
        None
    }

    /// Attempts allowed before the record is failed permanently.
    fn max_attempts(&self) -> Option<u32> {
        None
    }

    /// Claim lifetime other workers should assume for this job.
    fn max_run_time(&self) -> Option<Duration> {
        None
    }

    /// Custom retry time after the `attempts`-th failure.
    ///
    /// Values earlier than `now` are ignored in favour of the policy's backoff.
    fn reschedule_at(&self, _now: DateTime<Utc>, _attempts: u32) -> Option<DateTime<Utc>> {
        None
    }

    /// Whether a permanently failed record of this job should be deleted.
    fn destroy_failed_jobs(&self) -> Option<bool> {
        None
    }
}

/// A [`Job`] with a stable handler name that round-trips through a record's
/// JSON payload.
pub trait NamedJob: Job + Serialize + DeserializeOwned + 'static {
    /// Handler name stored on the record.
    const NAME: &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
