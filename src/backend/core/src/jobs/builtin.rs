//! Built-in jobs used for load testing a deployment.
//!
//! Each job sleeps for a fixed time on the `default` queue. Enqueue a mix of
//! them with `deferred enqueue` and watch throughput with `deferred stats`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{HandlerRegistry, Job, JobContext, JobResult, NamedJob};

/// Queue every benchmark job runs on.
pub const BENCHMARK_QUEUE: &str = "default";

async fn sleep_for(ctx: &JobContext, duration: Duration) -> JobResult {
    ctx.log_info(&format!("Sleeping for {:?}", duration));
    tokio::time::sleep(duration).await;
    Ok(())
}

/// Job: Sleep for 5 milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FastJob {}

#[async_trait]
impl Job for FastJob {
    async fn perform(&self, ctx: &JobContext) -> JobResult {
        sleep_for(ctx, Duration::from_millis(5)).await
    }

    fn queue_name(&self) -> Option<&str> {
        Some(BENCHMARK_QUEUE)
    }
}

impl NamedJob for FastJob {
    const NAME: &'static str = "FastJob";
}

/// Job: Sleep for 250 milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediumJob {}

#[async_trait]
impl Job for MediumJob {
    async fn perform(&self, ctx: &JobContext) -> JobResult {
        sleep_for(ctx, Duration::from_millis(250)).await
    }

    fn queue_name(&self) -> Option<&str> {
        Some(BENCHMARK_QUEUE)
    }
}

impl NamedJob for MediumJob {
    const NAME: &'static str = "MediumJob";
}

/// Job: Sleep for 2 seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlowJob {}

#[async_trait]
impl Job for SlowJob {
    async fn perform(&self, ctx: &JobContext) -> JobResult {
        sleep_for(ctx, Duration::from_secs(2)).await
    }

    fn queue_name(&self) -> Option<&str> {
        Some(BENCHMARK_QUEUE)
    }

    fn max_run_time(&self) -> Option<Duration> {
        Some(Duration::from_secs(60))
    }
}

impl NamedJob for SlowJob {
    const NAME: &'static str = "SlowJob";
}

pub(crate) fn register_builtin_jobs(registry: HandlerRegistry) -> HandlerRegistry {
    registry.with::<FastJob>().with::<MediumJob>().with::<SlowJob>()
}
