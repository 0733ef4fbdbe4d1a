//! Enqueue built-in sample jobs, for load generation and smoke tests.

use anyhow::Result;
use chrono::Utc;
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;

use deferred_core::jobs::{EnqueueOptions, FastJob, JobRecord, MediumJob, SlowJob};

use crate::client::Context;
use crate::output::{self, OutputFormat};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JobKind {
    /// Sleeps 5 ms
    Fast,
    /// Sleeps 250 ms
    Medium,
    /// Sleeps 2 s
    Slow,
}

#[derive(Args)]
pub struct EnqueueArgs {
    /// Sample job to enqueue
    #[arg(short, long, value_enum, default_value = "fast")]
    kind: JobKind,

    /// Number of jobs
    #[arg(short, long, default_value = "1")]
    count: usize,

    /// Job priority (lower runs first)
    #[arg(short, long)]
    priority: Option<i32>,

    /// Queue name
    #[arg(short, long)]
    queue: Option<String>,

    /// Delay before the jobs become eligible (e.g. "30s")
    #[arg(short, long, value_parser = humantime_serde::re::humantime::parse_duration)]
    delay: Option<Duration>,
}

#[derive(Tabled, Serialize)]
struct EnqueuedRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Handler")]
    handler: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Run At")]
    run_at: String,
}

impl From<JobRecord> for EnqueuedRow {
    fn from(record: JobRecord) -> Self {
        Self {
            id: record.id.0,
            handler: record.handler,
            priority: record.priority,
            queue: record.queue.unwrap_or_default(),
            run_at: record.run_at.to_rfc3339(),
        }
    }
}

pub async fn execute(args: EnqueueArgs, ctx: &Context, format: OutputFormat) -> Result<()> {
    let mut options = EnqueueOptions::new();
    if let Some(priority) = args.priority {
        options = options.priority(priority);
    }
    if let Some(queue) = &args.queue {
        options = options.queue(queue.clone());
    }
    if let Some(delay) = args.delay {
        options = options.run_at(Utc::now() + chrono::Duration::from_std(delay)?);
    }

    let queue = ctx.queue();
    let mut rows = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let record = match args.kind {
            JobKind::Fast => queue.enqueue(&FastJob {}, options.clone()).await?,
            JobKind::Medium => queue.enqueue(&MediumJob {}, options.clone()).await?,
            JobKind::Slow => queue.enqueue(&SlowJob {}, options.clone()).await?,
        };
        rows.push(EnqueuedRow::from(record));
    }

    match format {
        OutputFormat::Table => output::print_success(&format!(
            "Enqueued {} {:?} job(s)",
            rows.len(),
            args.kind
        )),
        _ => output::print_list(&rows, format)?,
    }
    Ok(())
}
