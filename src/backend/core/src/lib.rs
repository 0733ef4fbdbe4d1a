#![allow(clippy::result_large_err)]
//! # Deferred Core
//!
//! A persistent, storage-backed job queue. Workers poll a shared store,
//! claim jobs with a conditional update, run them, and record the outcome.
//!
//! ## Architecture
//!
//! - **Backend**: Storage trait with the claim-based reservation protocol,
//!   implemented for PostgreSQL and in memory
//! - **Jobs**: Job trait, handler registry, enqueue client, retry policy
//! - **Worker**: Sequential reserve/run/record loop with duty-cycle throttling
//!   and cooperative shutdown
//! - **Plugins**: Before/around/after callbacks on job lifecycle events
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod backend;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod plugins;
pub mod telemetry;

pub use error::{DeferredError, ErrorCode, ErrorContext, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{Backend, InMemoryBackend, QueueStats, ReserveCriteria};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::Config;
    pub use crate::db::PostgresBackend;
    pub use crate::error::{DeferredError, ErrorCode, ErrorContext, ErrorSeverity, Result};
    pub use crate::jobs::{
        EnqueueOptions, HandlerRegistry, Job, JobContext, JobError, JobId, JobQueue, JobRecord,
        JobResult, NamedJob, RetryPolicy, Worker, WorkerConfig, WorkerHandle,
    };
    pub use crate::plugins::{Event, HookArgs, Instrumentation, Lifecycle, Plugin};
}
