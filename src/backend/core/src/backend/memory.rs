//! In-memory backend.
//!
//! Records live in a mutex-guarded map. The claim compare-and-swap runs under
//! the same lock, so concurrent workers in one process see the same atomicity
//! guarantees a database row update gives them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{Backend, BackendInfo, QueueStats, ReserveCriteria};
use crate::error::{DeferredError, Result};
use crate::jobs::{JobId, JobRecord};

/// In-memory backend for tests and single-process embedding.
#[derive(Debug)]
pub struct InMemoryBackend {
    jobs: Mutex<BTreeMap<JobId, JobRecord>>,
    next_id: AtomicI64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// A stored record by id.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.lock().get(&id).cloned()
    }

    /// Every stored record in id order.
    pub fn all(&self) -> Vec<JobRecord> {
        self.jobs.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            adapter: "memory".to_string(),
            database: "memory".to_string(),
            table: "deferred_jobs".to_string(),
        }
    }

    async fn insert(&self, record: &JobRecord) -> Result<JobRecord> {
        let mut stored = record.clone();
        stored.id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.jobs.lock().insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn candidates(&self, criteria: &ReserveCriteria) -> Result<Vec<JobRecord>> {
        let jobs = self.jobs.lock();
        let mut candidates: Vec<JobRecord> = jobs
            .values()
            .filter(|record| criteria.matches(record))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.run_at.cmp(&b.run_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(criteria.read_ahead);
        Ok(candidates)
    }

    async fn claim(&self, candidate: &JobRecord, criteria: &ReserveCriteria) -> Result<Option<JobRecord>> {
        let mut jobs = self.jobs.lock();
        let Some(stored) = jobs.get_mut(&candidate.id) else {
            return Ok(None);
        };
        if stored.locked_at != candidate.locked_at || !criteria.matches(stored) {
            return Ok(None);
        }
        stored.locked_at = Some(criteria.now);
        stored.locked_by = Some(criteria.worker.clone());
        stored.updated_at = criteria.now;
        Ok(Some(stored.clone()))
    }

    async fn update(&self, record: &JobRecord) -> Result<()> {
        let mut jobs = self.jobs.lock();
        match jobs.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(DeferredError::not_found(record.id)),
        }
    }

    async fn destroy(&self, record: &JobRecord) -> Result<()> {
        self.jobs.lock().remove(&record.id);
        Ok(())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats> {
        let jobs = self.jobs.lock();
        let mut stats = QueueStats::default();
        for record in jobs.values() {
            stats.count(record, now);
        }
        Ok(stats)
    }

    async fn clear(&self, failed_only: bool) -> Result<u64> {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        if failed_only {
            jobs.retain(|_, record| !record.is_failed());
        } else {
            jobs.clear();
        }
        Ok((before - jobs.len()) as u64)
    }
}
