//! Deferred CLI: run workers and manage the job queue.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use deferred_core::config::Config;
use deferred_core::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

use commands::{clear, enqueue, migrate, stats, work};
use output::OutputFormat;

/// Deferred - persistent job queue
#[derive(Parser)]
#[command(
    name = "deferred",
    version,
    about = "Deferred - persistent job queue",
    long_about = "Run job workers, enqueue sample jobs and inspect the job table.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (toml, yaml or json)
    #[arg(short, long, global = true, env = "DEFERRED_CONFIG")]
    config: Option<String>,

    /// Database URL, overriding the configuration
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log format, overriding the configuration
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run job workers
    Work(work::WorkArgs),

    /// Enqueue built-in sample jobs
    Enqueue(enqueue::EnqueueArgs),

    /// Show job counts by state
    Stats,

    /// Delete jobs
    Clear(clear::ClearArgs),

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    let _telemetry = init_telemetry(&TelemetryConfig {
        logging: config.logging.clone(),
        metrics: config.metrics.clone(),
    })?;

    let ctx = client::Context::connect(config).await?;
    let format = cli.output;

    match cli.command {
        Commands::Work(args) => work::execute(args, &ctx, format).await,
        Commands::Enqueue(args) => enqueue::execute(args, &ctx, format).await,
        Commands::Stats => stats::execute(&ctx, format).await,
        Commands::Clear(args) => clear::execute(args, &ctx).await,
        Commands::Migrate => migrate::execute(&ctx).await,
    }
}
