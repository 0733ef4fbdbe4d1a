//! Failure handling: backoff, attempt limits and terminal disposition.
//!
//! [`RetryPolicy::decide`] is pure. The worker applies the resulting
//! [`Disposition`] to the record and persists it inside the error or failure
//! lifecycle event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::{FailureKind, Job, JobError, JobRecord};

/// Longest backoff any strategy will produce.
pub const MAX_BACKOFF: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `last_error` is cut to this many characters before it is stored.
pub const MAX_LAST_ERROR_LEN: usize = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
///
/// Every strategy is non-decreasing in the attempt count, so later failures
/// never retry sooner than earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `attempts^exponent + base_delay_secs` seconds
    Polynomial { exponent: u32, base_delay_secs: u64 },
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Linear increase in delay
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    /// Exponential increase in delay, capped
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Polynomial {
            exponent: 4,
            base_delay_secs: 5,
        }
    }
}

impl BackoffStrategy {
    /// Delay after the `attempts`-th failure (1 for the first failure).
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let secs = match self {
            Self::Polynomial {
                exponent,
                base_delay_secs,
            } => u64::from(attempts)
                .saturating_pow(*exponent)
                .saturating_add(*base_delay_secs),
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs
                .saturating_add(increment_secs.saturating_mul(u64::from(attempts - 1))),
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let multiplier = multiplier.max(1.0);
                let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
                let delay = (*initial_delay_secs as f64) * multiplier.powi(exponent);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs).min(MAX_BACKOFF)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    /// Create an exponential backoff strategy doubling from `initial_delay_secs`.
    pub fn exponential(initial_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self::Exponential {
            initial_delay_secs,
            max_delay_secs,
            multiplier: 2.0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed before a record is failed permanently
    pub max_attempts: u32,
    /// Backoff between attempts
    pub backoff: BackoffStrategy,
    /// Delete permanently failed records instead of keeping them
    pub destroy_failed_jobs: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            backoff: BackoffStrategy::default(),
            destroy_failed_jobs: false,
        }
    }
}

/// What to do with a record after a failed execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Release the claim and run again at `run_at`.
    Reschedule {
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: String,
    },
    /// Terminal failure. The record is deleted when `destroy` is set.
    Fail {
        failed_at: DateTime<Utc>,
        attempts: u32,
        last_error: String,
        destroy: bool,
    },
}

impl RetryPolicy {
    /// Create a policy with the given attempt limit.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delete records on terminal failure.
    pub fn destroying_failed_jobs(mut self, destroy: bool) -> Self {
        self.destroy_failed_jobs = destroy;
        self
    }

    /// Attempt limit for `record`. The record's own value wins, then the job's.
    pub fn max_attempts_for(&self, record: &JobRecord, job: Option<&dyn Job>) -> u32 {
        record
            .max_attempts
            .or_else(|| job.and_then(|job| job.max_attempts()))
            .unwrap_or(self.max_attempts)
    }

    /// Time of the next attempt after the `attempts`-th failure.
    pub fn next_run_at(
        &self,
        now: DateTime<Utc>,
        attempts: u32,
        job: Option<&dyn Job>,
    ) -> DateTime<Utc> {
        if let Some(custom) = job.and_then(|job| job.reschedule_at(now, attempts)) {
            if custom >= now {
                return custom;
            }
        }

        chrono::Duration::from_std(self.backoff.delay_for_attempt(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Decide the fate of `record` after `error`.
    ///
    /// `attempts` grows by one. `AbortWorker` errors never reach the policy;
    /// if one does it is treated as retryable.
    pub fn decide(
        &self,
        record: &JobRecord,
        job: Option<&dyn Job>,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> Disposition {
        let attempts = record.attempts.saturating_add(1);
        let last_error = truncate_error(&error.to_string());
        let exhausted = attempts >= self.max_attempts_for(record, job);

        if error.kind == FailureKind::Permanent || exhausted {
            let destroy = job
                .and_then(|job| job.destroy_failed_jobs())
                .unwrap_or(self.destroy_failed_jobs);
            return Disposition::Fail {
                failed_at: now,
                attempts,
                last_error,
                destroy,
            };
        }

        Disposition::Reschedule {
            run_at: self.next_run_at(now, attempts, job),
            attempts,
            last_error,
        }
    }
}

impl Disposition {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Reschedule { attempts, .. } | Self::Fail { attempts, .. } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fail { .. })
    }

    /// Write the outcome onto `record` and release its claim.
    pub fn apply(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        match self {
            Self::Reschedule {
                run_at,
                attempts,
                last_error,
            } => {
                record.run_at = *run_at;
                record.attempts = *attempts;
                record.last_error = Some(last_error.clone());
            }
            Self::Fail {
                failed_at,
                attempts,
                last_error,
                ..
            } => {
                record.failed_at = Some(*failed_at);
                record.attempts = *attempts;
                record.last_error = Some(last_error.clone());
            }
        }
        record.unlock();
        record.updated_at = now;
    }
}

fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_LAST_ERROR_LEN) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
