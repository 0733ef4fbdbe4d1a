//! Run workers until shutdown, an empty queue, or a fatal error.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::time::Duration;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use deferred_core::jobs::WorkerConfig;

use crate::client::Context;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct WorkArgs {
    /// Queues to work (repeat or comma-separate); all queues when omitted
    #[arg(short, long = "queue", value_delimiter = ',')]
    queues: Vec<String>,

    /// Lowest priority value to reserve
    #[arg(long)]
    min_priority: Option<i32>,

    /// Highest priority value to reserve
    #[arg(long)]
    max_priority: Option<i32>,

    /// Sleep between polls when no work was found (e.g. "5s")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    sleep_delay: Option<Duration>,

    /// Candidates fetched per reservation attempt
    #[arg(long)]
    read_ahead: Option<usize>,

    /// Claim lifetime before other workers may take a job over (e.g. "20m")
    #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
    max_run_time: Option<Duration>,

    /// Exit once no jobs are available
    #[arg(long)]
    exit_on_complete: bool,

    /// Fraction of wall time spent working, in (0, 1]
    #[arg(long)]
    max_duty_cycle: Option<f64>,

    /// Jobs per work cycle
    #[arg(long)]
    limit: Option<usize>,

    /// Worker name written to locked_by
    #[arg(short, long)]
    name: Option<String>,

    /// Number of workers to run in this process
    #[arg(short, long, default_value = "1")]
    workers: usize,
}

impl WorkArgs {
    fn apply(&self, mut config: WorkerConfig) -> WorkerConfig {
        if !self.queues.is_empty() {
            config.queues = self.queues.clone();
        }
        if self.min_priority.is_some() {
            config.min_priority = self.min_priority;
        }
        if self.max_priority.is_some() {
            config.max_priority = self.max_priority;
        }
        if let Some(sleep_delay) = self.sleep_delay {
            config.sleep_delay = sleep_delay;
        }
        if let Some(read_ahead) = self.read_ahead {
            config.read_ahead = read_ahead;
        }
        if let Some(max_run_time) = self.max_run_time {
            config.max_run_time = max_run_time;
        }
        if self.exit_on_complete {
            config.exit_on_complete = true;
        }
        if let Some(duty) = self.max_duty_cycle {
            config.max_duty_cycle = duty;
        }
        if let Some(limit) = self.limit {
            config.work_off_limit = limit;
        }
        if self.name.is_some() {
            config.name = self.name.clone();
        }
        config
    }
}

#[derive(Tabled, Serialize)]
struct WorkerSummary {
    #[tabled(rename = "Worker")]
    name: String,
    #[tabled(rename = "Processed")]
    processed: u64,
    #[tabled(rename = "Succeeded")]
    succeeded: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Result")]
    result: String,
}

pub async fn execute(args: WorkArgs, ctx: &Context, format: OutputFormat) -> Result<()> {
    if args.workers == 0 {
        anyhow::bail!("--workers must be at least 1");
    }

    let config = args.apply(ctx.config.worker.clone());
    config.validate()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut handles = Vec::with_capacity(args.workers);
    for index in 0..args.workers {
        let mut worker_config = config.clone();
        if args.workers > 1 {
            worker_config.name = config.name.as_ref().map(|name| format!("{}.{}", name, index));
        }
        handles.push(ctx.worker(worker_config, shutdown.child_token())?.spawn());
    }

    output::print_info(&format!(
        "Started {} worker(s); press Ctrl+C to stop after the current job",
        handles.len()
    ));

    let joins = handles.into_iter().map(|handle| {
        let shutdown = shutdown.clone();
        async move {
            let name = handle.name().to_string();
            let stats = handle.stats().clone();
            let result = handle.join().await;
            // One fatal worker stops the rest.
            if result.is_err() {
                shutdown.cancel();
            }
            (name, stats, result)
        }
    });

    let mut summaries = Vec::new();
    let mut failure = None;
    for (name, stats, result) in futures::future::join_all(joins).await {
        let outcome = match result {
            Ok(()) => "stopped".to_string(),
            Err(error) => {
                let message = error.to_string();
                failure.get_or_insert(error);
                message
            }
        };
        summaries.push(WorkerSummary {
            name,
            processed: stats.processed(),
            succeeded: stats.succeeded(),
            failed: stats.failed(),
            result: outcome,
        });
    }

    output::print_list(&summaries, format)?;

    match failure {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => return,
    }

    info!("Shutdown signal received, finishing current jobs");
    token.cancel();
}
