//! Storage backends for job records.
//!
//! A [`Backend`] persists [`JobRecord`]s and exposes the two primitives the
//! reservation protocol is built from:
//!
//! - `candidates`: a bounded, ordered snapshot of reservable records
//! - `claim`: an atomic compare-and-swap on `locked_at` guarded by the criteria
//!
//! [`Backend::reserve`] combines them (see [`reservation`]). Two backends ship
//! with the crate: [`InMemoryBackend`] for tests and embedding, and
//! [`crate::db::PostgresBackend`] for production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DeferredError, Result};
use crate::jobs::JobRecord;

pub mod memory;
pub mod reservation;

pub use memory::InMemoryBackend;

// ═══════════════════════════════════════════════════════════════════════════════
// Reservation Criteria
// ═══════════════════════════════════════════════════════════════════════════════

/// What a worker is willing to reserve, evaluated at `now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveCriteria {
    /// Name written to `locked_by` on a successful claim
    pub worker: String,
    /// Queues to draw from; empty means every queue
    pub queues: Vec<String>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    /// Claim lifetime for records without their own `max_run_time`
    #[serde(with = "humantime_serde")]
    pub max_run_time: Duration,
    /// Candidates fetched per reservation attempt
    pub read_ahead: usize,
    pub now: DateTime<Utc>,
}

impl ReserveCriteria {
    /// Whether `record` may be reserved under these criteria.
    ///
    /// A record is reservable when it has not failed, is due, is unlocked or
    /// stale, and passes the queue and priority filters.
    pub fn matches(&self, record: &JobRecord) -> bool {
        if record.is_failed() || record.run_at > self.now {
            return false;
        }
        if record.is_locked() && !record.is_stale(self.max_run_time, self.now) {
            return false;
        }
        if !self.queues.is_empty() {
            match &record.queue {
                Some(queue) if self.queues.iter().any(|q| q == queue) => {}
                _ => return false,
            }
        }
        if self.min_priority.is_some_and(|min| record.priority < min) {
            return false;
        }
        if self.max_priority.is_some_and(|max| record.priority > max) {
            return false;
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Info & Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Where records live. Reported in instrumentation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub adapter: String,
    pub database: String,
    pub table: String,
}

/// Record counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Due and unlocked
    pub ready: u64,
    /// Unlocked but `run_at` is in the future
    pub scheduled: u64,
    /// Currently claimed, including stale claims
    pub locked: u64,
    /// Failed permanently
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.ready + self.scheduled + self.locked + self.failed
    }

    pub(crate) fn count(&mut self, record: &JobRecord, now: DateTime<Utc>) {
        if record.is_failed() {
            self.failed += 1;
        } else if record.is_locked() {
            self.locked += 1;
        } else if record.run_at > now {
            self.scheduled += 1;
        } else {
            self.ready += 1;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for job storage backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Describe the backing store.
    fn info(&self) -> BackendInfo;

    /// Persist a new record and return it with its assigned id.
    async fn insert(&self, record: &JobRecord) -> Result<JobRecord>;

    /// Up to `criteria.read_ahead` reservable records ordered by
    /// `(priority, run_at, id)`.
    async fn candidates(&self, criteria: &ReserveCriteria) -> Result<Vec<JobRecord>>;

    /// Atomically lock `candidate` for `criteria.worker`.
    ///
    /// Succeeds only if the stored `locked_at` still equals the candidate's
    /// observed `locked_at` and the stored record still passes
    /// [`ReserveCriteria::matches`]. Returns the stored record as locked, or
    /// `None` when another worker got there first or the record was
    /// rescheduled in between.
    async fn claim(&self, candidate: &JobRecord, criteria: &ReserveCriteria) -> Result<Option<JobRecord>>;

    /// Reserve at most one record.
    async fn reserve(&self, criteria: &ReserveCriteria) -> Result<Option<JobRecord>> {
        reservation::reserve(self, criteria).await
    }

    /// Overwrite the mutable fields of an existing record.
    async fn update(&self, record: &JobRecord) -> Result<()>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn destroy(&self, record: &JobRecord) -> Result<()>;

    /// Called after a failed reservation so the backend can repair itself
    /// (for example by dropping broken connections).
    async fn recover_from(&self, _error: &DeferredError) -> Result<()> {
        Ok(())
    }

    /// Record counts as of `now`.
    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats>;

    /// Delete every record, or only failed ones. Returns the number deleted.
    async fn clear(&self, failed_only: bool) -> Result<u64>;
}
