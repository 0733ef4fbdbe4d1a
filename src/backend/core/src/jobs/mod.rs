//! Jobs, the enqueue client and the worker.
//!
//! - **Job Definitions**: [`Job`] payloads decoded by name through a [`HandlerRegistry`]
//! - **Queue**: [`JobQueue`] prepares and inserts [`JobRecord`]s
//! - **Worker**: [`Worker`] reserves, runs and records jobs, throttled by a duty cycle
//! - **Retry**: [`RetryPolicy`] turns failures into a reschedule or a permanent failure
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  enqueue   ┌───────────┐  reserve   ┌───────────┐
//! │ JobQueue  │──────────▶│  Backend  │◀──────────│  Worker   │
//! └───────────┘            └───────────┘  update /  └─────┬─────┘
//!                                         destroy         │ perform
//!                                                   ┌─────▼─────┐
//!                                                   │ dyn Job   │
//!                                                   └───────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use deferred_core::backend::InMemoryBackend;
//! use deferred_core::jobs::{
//!     EnqueueOptions, HandlerRegistry, Job, JobContext, JobQueue, JobResult, NamedJob, Worker,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendMail { to: String }
//!
//! #[async_trait]
//! impl Job for SendMail {
//!     async fn perform(&self, ctx: &JobContext) -> JobResult {
//!         ctx.log_info(&format!("mailing {}", self.to));
//!         Ok(())
//!     }
//! }
//!
//! impl NamedJob for SendMail {
//!     const NAME: &'static str = "SendMail";
//! }
//!
//! let backend = Arc::new(InMemoryBackend::new());
//! let handlers = Arc::new(HandlerRegistry::new().with::<SendMail>());
//!
//! let queue = JobQueue::new(backend.clone(), handlers.clone());
//! queue.enqueue(&SendMail { to: "ops@example.com".into() }, EnqueueOptions::new()).await?;
//!
//! let mut worker = Worker::builder(backend, handlers).build()?;
//! worker.work_off(10).await?;
//! ```

pub mod builtin;
pub mod handlers;
pub mod job;
pub mod queue;
pub mod retry;
pub mod throttle;
pub mod worker;

pub use builtin::{FastJob, MediumJob, SlowJob, BENCHMARK_QUEUE};
pub use handlers::HandlerRegistry;
pub use job::{
    FailureKind, Job, JobContext, JobError, JobId, JobRecord, JobResult, NamedJob,
};
pub use queue::{EnqueueConfig, EnqueueOptions, JobQueue};
pub use retry::{BackoffStrategy, Disposition, RetryPolicy, MAX_BACKOFF, MAX_LAST_ERROR_LEN};
pub use throttle::DutyCycle;
pub use worker::{
    default_worker_name, JobOutcome, WorkOffResult, Worker, WorkerBuilder, WorkerConfig,
    WorkerHandle, WorkerState, WorkerStats, MAX_CONSECUTIVE_BACKEND_FAILURES,
};
