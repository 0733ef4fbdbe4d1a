//! Optimistic reservation over a [`Backend`].
//!
//! 1. Fetch up to `read_ahead` candidates ordered by `(priority, run_at, id)`.
//! 2. Try to claim each in order with a compare-and-swap on `locked_at` that
//!    re-checks eligibility against the stored record.
//! 3. Return the stored record of the first claim that succeeded.
//!
//! Losing a race on one candidate moves on to the next. If every candidate is
//! lost the call returns `None` and the worker polls again on its next cycle.
//! Two workers can never both succeed on the same record: the claim only
//! matches while the stored `locked_at` equals the value the candidate was
//! read with, and every successful claim changes it. A record released and
//! rescheduled between the read and the claim no longer matches the criteria,
//! so the claim fails instead of running it early.

use tracing::{debug, trace};

use super::{Backend, ReserveCriteria};
use crate::error::Result;
use crate::jobs::JobRecord;
use crate::telemetry::metrics::JobMetrics;

/// Reserve at most one record for `criteria.worker`.
pub async fn reserve<B>(backend: &B, criteria: &ReserveCriteria) -> Result<Option<JobRecord>>
where
    B: Backend + ?Sized,
{
    let candidates = backend.candidates(criteria).await?;
    trace!(
        worker = %criteria.worker,
        candidates = candidates.len(),
        "Fetched reservation candidates"
    );

    for candidate in candidates.into_iter().take(criteria.read_ahead) {
        if let Some(claimed) = backend.claim(&candidate, criteria).await? {
            JobMetrics::reserved(claimed.queue.as_deref());
            return Ok(Some(claimed));
        }

        debug!(
            worker = %criteria.worker,
            job_id = %candidate.id,
            "Lost reservation race"
        );
        JobMetrics::claim_conflict();
    }

    Ok(None)
}
