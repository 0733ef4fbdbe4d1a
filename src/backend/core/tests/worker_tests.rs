//! Worker behaviour against the in-memory backend.
//!
//! Tests cover:
//! - Success, retry and permanent failure paths
//! - Lifecycle hooks around execution and failure recording
//! - Backend failure escalation
//! - Duty-cycle throttling and shutdown

use async_trait::async_trait;
use chrono::Utc;
use deferred_core::backend::{Backend, BackendInfo, InMemoryBackend, QueueStats, ReserveCriteria};
use deferred_core::clock::{Clock, ManualClock};
use deferred_core::error::{DeferredError, ErrorCode, Result};
use deferred_core::jobs::{
    EnqueueOptions, HandlerRegistry, Job, JobContext, JobError, JobQueue, JobRecord, JobResult,
    NamedJob, RetryPolicy, WorkOffResult, Worker, WorkerConfig, WorkerState,
};
use deferred_core::plugins::instrumentation::{self, MemoryNotifier};
use deferred_core::plugins::{CallbackPlugin, Event, Instrumentation, Lifecycle, Plugin};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Test Jobs
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct SucceedingJob {}

#[async_trait]
impl Job for SucceedingJob {
    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        Ok(())
    }
}

impl NamedJob for SucceedingJob {
    const NAME: &'static str = "SucceedingJob";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FailingJob {}

#[async_trait]
impl Job for FailingJob {
    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        Err(JobError::retryable("did not work"))
    }
}

impl NamedJob for FailingJob {
    const NAME: &'static str = "FailingJob";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PermanentJob {}

#[async_trait]
impl Job for PermanentJob {
    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        Err(JobError::permanent("malformed input"))
    }
}

impl NamedJob for PermanentJob {
    const NAME: &'static str = "PermanentJob";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AbortingJob {}

#[async_trait]
impl Job for AbortingJob {
    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        Err(JobError::abort_worker("stop everything"))
    }
}

impl NamedJob for AbortingJob {
    const NAME: &'static str = "AbortingJob";
}

#[derive(Debug, Serialize, Deserialize)]
struct SleepingJob {
    millis: u64,
}

#[async_trait]
impl Job for SleepingJob {
    async fn perform(&self, _ctx: &JobContext) -> JobResult {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

impl NamedJob for SleepingJob {
    const NAME: &'static str = "SleepingJob";
}

// ============================================================================
// Helpers
// ============================================================================

fn handlers() -> Arc<HandlerRegistry> {
    Arc::new(
        HandlerRegistry::new()
            .with::<SucceedingJob>()
            .with::<FailingJob>()
            .with::<PermanentJob>()
            .with::<AbortingJob>()
            .with::<SleepingJob>(),
    )
}

type EventLog = Arc<Mutex<Vec<(Event, i32, Option<String>)>>>;

/// Lifecycle recording every after-callback for `events`.
fn recording_lifecycle(events: &[Event]) -> (Arc<Lifecycle>, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let events = events.to_vec();
    let recorder = log.clone();
    let plugin = CallbackPlugin::new("recorder", move |lifecycle| {
        for event in &events {
            let recorder = recorder.clone();
            let event = *event;
            lifecycle.after(event, move |args| {
                if let Some(job) = args.job {
                    recorder.lock().push((event, job.priority, job.queue.clone()));
                }
                Ok(())
            });
        }
    });
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(plugin)];
    (Arc::new(Lifecycle::with_plugins(plugins)), log)
}

fn fired(log: &EventLog, event: Event) -> usize {
    log.lock().iter().filter(|(e, _, _)| *e == event).count()
}

// ============================================================================
// Success and Failure Tests
// ============================================================================

#[tokio::test]
async fn test_work_off_runs_job_and_fires_success_hook() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let (lifecycle, log) = recording_lifecycle(&[Event::Execute]);

    let queue = JobQueue::new(backend.clone(), handlers.clone()).with_lifecycle(lifecycle.clone());
    assert_ok!(
        queue
            .enqueue(&SucceedingJob {}, EnqueueOptions::new().priority(13).queue("test"))
            .await
    );

    let mut worker = Worker::builder(backend.clone(), handlers)
        .lifecycle(lifecycle)
        .build()
        .unwrap();
    let result = worker.work_off(1).await.unwrap();

    assert_eq!(result, WorkOffResult { succeeded: 1, failed: 0 });
    assert!(backend.is_empty());
    assert_eq!(
        *log.lock(),
        vec![(Event::Execute, 13, Some("test".to_string()))]
    );
    assert_eq!(worker.stats().succeeded(), 1);
}

#[tokio::test]
async fn test_single_attempt_job_fails_permanently() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let (lifecycle, log) = recording_lifecycle(&[Event::Error, Event::Failure]);

    let queue = JobQueue::new(backend.clone(), handlers.clone());
    let record = queue
        .enqueue(&FailingJob {}, EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers)
        .lifecycle(lifecycle)
        .build()
        .unwrap();
    let result = worker.work_off(1).await.unwrap();
    assert_eq!(result, WorkOffResult { succeeded: 0, failed: 1 });

    let stored = backend.get(record.id).unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(stored.failed_at.is_some());
    assert!(stored.locked_at.is_none());
    assert!(stored.locked_by.is_none());
    assert!(stored.last_error.unwrap().contains("did not work"));
    assert_eq!(fired(&log, Event::Failure), 1);
    assert_eq!(fired(&log, Event::Error), 0);
}

#[tokio::test]
async fn test_retryable_failure_is_rescheduled_with_backoff() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let clock = Arc::new(ManualClock::default());
    let (lifecycle, log) = recording_lifecycle(&[Event::Error, Event::Failure]);

    let queue = JobQueue::new(backend.clone(), handlers.clone()).with_clock(clock.clone());
    let record = queue.enqueue(&FailingJob {}, EnqueueOptions::new()).await.unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers)
        .lifecycle(lifecycle)
        .clock(clock.clone())
        .build()
        .unwrap();

    let started = clock.now();
    assert_eq!(worker.work_off(1).await.unwrap().failed, 1);

    let stored = backend.get(record.id).unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(stored.failed_at.is_none());
    assert!(stored.locked_at.is_none());
    // 1^4 + 5 seconds
    assert_eq!(stored.run_at, started + chrono::Duration::seconds(6));
    assert_eq!(fired(&log, Event::Error), 1);

    // Not due yet.
    assert_eq!(worker.work_off(1).await.unwrap().total(), 0);

    clock.advance(chrono::Duration::seconds(6));
    assert_eq!(worker.work_off(1).await.unwrap().failed, 1);

    let stored = backend.get(record.id).unwrap();
    assert_eq!(stored.attempts, 2);
    // 2^4 + 5 seconds
    assert_eq!(stored.run_at, clock.now() + chrono::Duration::seconds(21));
    assert_eq!(fired(&log, Event::Error), 2);
    assert_eq!(fired(&log, Event::Failure), 0);
}

#[tokio::test]
async fn test_permanent_error_skips_remaining_attempts() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    let record = queue.enqueue(&PermanentJob {}, EnqueueOptions::new()).await.unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers).build().unwrap();
    worker.work_off(1).await.unwrap();

    let stored = backend.get(record.id).unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(stored.failed_at.is_some());
}

#[tokio::test]
async fn test_destroy_failed_jobs_removes_record() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    queue.enqueue(&PermanentJob {}, EnqueueOptions::new()).await.unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers)
        .retry_policy(RetryPolicy::default().destroying_failed_jobs(true))
        .build()
        .unwrap();
    assert_eq!(worker.work_off(1).await.unwrap().failed, 1);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_unknown_handler_fails_permanently() {
    let backend = Arc::new(InMemoryBackend::new());
    let now = Utc::now();
    let inserted = backend
        .insert(&JobRecord::new("RemovedJob", serde_json::json!({}), now, now))
        .await
        .unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers()).build().unwrap();
    assert_eq!(worker.work_off(1).await.unwrap().failed, 1);

    let stored = backend.get(inserted.id).unwrap();
    assert!(stored.failed_at.is_some());
    assert!(stored.last_error.unwrap().contains("RemovedJob"));
}

#[tokio::test]
async fn test_abort_worker_stops_work_off() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    let record = queue.enqueue(&AbortingJob {}, EnqueueOptions::new()).await.unwrap();
    queue.enqueue(&SucceedingJob {}, EnqueueOptions::new().priority(20)).await.unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers).build().unwrap();
    let err = assert_err!(worker.work_off(10).await);
    assert_eq!(err.code(), ErrorCode::WorkerAborted);

    // The aborting job keeps its claim; the second job never ran.
    assert!(backend.get(record.id).unwrap().is_locked());
    assert_eq!(backend.len(), 2);
}

// ============================================================================
// Lifecycle Hook Tests
// ============================================================================

#[tokio::test]
async fn test_execute_hook_error_is_job_failure() {
    let plugin = CallbackPlugin::new("broken", |lifecycle| {
        lifecycle.before(Event::Execute, |_| {
            Err(DeferredError::internal("hook exploded"))
        });
    });
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(plugin)];
    let lifecycle = Arc::new(Lifecycle::with_plugins(plugins));

    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    let record = queue.enqueue(&SucceedingJob {}, EnqueueOptions::new()).await.unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers)
        .lifecycle(lifecycle)
        .build()
        .unwrap();
    assert_eq!(worker.work_off(1).await.unwrap().failed, 1);

    let stored = backend.get(record.id).unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.unwrap().contains("hook exploded"));
}

#[tokio::test]
async fn test_thread_hook_can_skip_execution() {
    let plugin = CallbackPlugin::new("gate", |lifecycle| {
        lifecycle.around(Event::Thread, |_args, _next| Box::pin(async { Ok(()) }));
    });
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(plugin)];
    let lifecycle = Arc::new(Lifecycle::with_plugins(plugins));

    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    let record = queue.enqueue(&SucceedingJob {}, EnqueueOptions::new()).await.unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers)
        .lifecycle(lifecycle)
        .build()
        .unwrap();
    assert_eq!(worker.work_off(5).await.unwrap().total(), 0);

    let stored = backend.get(record.id).unwrap();
    assert!(stored.is_locked());
    assert_eq!(stored.attempts, 0);
}

#[tokio::test]
async fn test_instrumentation_publishes_run_and_failure() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let notifier = Arc::new(MemoryNotifier::new());
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(Instrumentation::with_notifier(
        backend.info(),
        notifier.clone(),
    ))];
    let lifecycle = Arc::new(Lifecycle::with_plugins(plugins));

    let queue = JobQueue::new(backend.clone(), handlers.clone()).with_lifecycle(lifecycle.clone());
    queue.enqueue(&SucceedingJob {}, EnqueueOptions::new()).await.unwrap();
    queue
        .enqueue(&FailingJob {}, EnqueueOptions::new().max_attempts(1))
        .await
        .unwrap();

    let mut worker = Worker::builder(backend.clone(), handlers)
        .lifecycle(lifecycle)
        .build()
        .unwrap();
    worker.work_off(10).await.unwrap();

    assert_eq!(notifier.named(instrumentation::ENQUEUE).len(), 2);
    let runs = notifier.named(instrumentation::RUN);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs.iter().filter(|n| n.failed).count(), 1);
    assert_eq!(notifier.named(instrumentation::FAILURE).len(), 1);
    assert!(notifier.named(instrumentation::ERROR).is_empty());

    let failure = &notifier.named(instrumentation::FAILURE)[0];
    assert_eq!(failure.payload.job_name, "FailingJob");
    assert_eq!(failure.payload.database_adapter, "memory");
}

// ============================================================================
// Backend Failure Tests
// ============================================================================

/// Backend whose reservation queries always fail.
#[derive(Default)]
struct UnreachableBackend {
    recoveries: AtomicU32,
}

#[async_trait]
impl Backend for UnreachableBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            adapter: "unreachable".to_string(),
            database: "none".to_string(),
            table: "deferred_jobs".to_string(),
        }
    }

    async fn insert(&self, record: &JobRecord) -> Result<JobRecord> {
        Ok(record.clone())
    }

    async fn candidates(&self, _criteria: &ReserveCriteria) -> Result<Vec<JobRecord>> {
        Err(DeferredError::new(
            ErrorCode::DatabaseConnectionFailed,
            "connection refused",
        ))
    }

    async fn claim(&self, _candidate: &JobRecord, _criteria: &ReserveCriteria) -> Result<Option<JobRecord>> {
        Ok(None)
    }

    async fn update(&self, _record: &JobRecord) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self, _record: &JobRecord) -> Result<()> {
        Ok(())
    }

    async fn recover_from(&self, _error: &DeferredError) -> Result<()> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self, _now: chrono::DateTime<Utc>) -> Result<QueueStats> {
        Ok(QueueStats::default())
    }

    async fn clear(&self, _failed_only: bool) -> Result<u64> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_tenth_consecutive_reservation_failure_is_fatal() {
    let backend = Arc::new(UnreachableBackend::default());
    let mut worker = Worker::builder(backend.clone(), handlers()).build().unwrap();

    for _ in 0..9 {
        assert_eq!(worker.work_off(1).await.unwrap().total(), 0);
    }
    let err = worker.work_off(1).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::FatalBackend);
    assert_eq!(backend.recoveries.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_fatal_backend_error_stops_spawned_worker() {
    let backend = Arc::new(UnreachableBackend::default());
    let config = WorkerConfig {
        sleep_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let handle = Worker::builder(backend, handlers())
        .config(config)
        .build()
        .unwrap()
        .spawn();

    let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    assert_eq!(result.unwrap_err().code(), ErrorCode::FatalBackend);
}

// ============================================================================
// Control Loop Tests
// ============================================================================

#[tokio::test]
async fn test_exit_on_complete_drains_queue() {
    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    for _ in 0..3 {
        queue.enqueue(&SucceedingJob {}, EnqueueOptions::new()).await.unwrap();
    }

    let config = WorkerConfig {
        exit_on_complete: true,
        ..Default::default()
    };
    let mut worker = Worker::builder(backend.clone(), handlers)
        .config(config)
        .build()
        .unwrap();
    assert_ok!(worker.start().await);

    assert!(backend.is_empty());
    assert_eq!(worker.stats().processed(), 3);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_sleep() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = WorkerConfig {
        sleep_delay: Duration::from_secs(3600),
        ..Default::default()
    };
    let handle = Worker::builder(backend, handlers())
        .config(config)
        .build()
        .unwrap()
        .spawn();

    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), handle.join()).await;
    assert_ok!(result.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_duty_cycle_spaces_out_work_cycles() {
    let reserved_at = Arc::new(Mutex::new(Vec::new()));
    let recorder = reserved_at.clone();
    let plugin = CallbackPlugin::new("timing", move |lifecycle| {
        let recorder = recorder.clone();
        lifecycle.before(Event::Reserve, move |_| {
            recorder.lock().push(tokio::time::Instant::now());
            Ok(())
        });
    });
    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(plugin)];
    let lifecycle = Arc::new(Lifecycle::with_plugins(plugins));

    let backend = Arc::new(InMemoryBackend::new());
    let handlers = handlers();
    let queue = JobQueue::new(backend.clone(), handlers.clone());
    for _ in 0..2 {
        queue
            .enqueue(&SleepingJob { millis: 100 }, EnqueueOptions::new())
            .await
            .unwrap();
    }

    let config = WorkerConfig {
        max_duty_cycle: 0.5,
        work_off_limit: 1,
        exit_on_complete: true,
        ..Default::default()
    };
    let mut worker = Worker::builder(backend.clone(), handlers)
        .config(config)
        .lifecycle(lifecycle)
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let reserved_at = reserved_at.lock();
    assert!(reserved_at.len() >= 2);
    // 100ms of work at a 50% duty cycle requires 100ms idle.
    assert!(reserved_at[1] - reserved_at[0] >= Duration::from_millis(200));
    assert!(backend.is_empty());
}

#[test]
fn test_invalid_config_rejected_at_build() {
    let config = WorkerConfig {
        max_duty_cycle: 0.0,
        ..Default::default()
    };
    let err = Worker::builder(Arc::new(InMemoryBackend::new()), handlers())
        .config(config)
        .build()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
}
