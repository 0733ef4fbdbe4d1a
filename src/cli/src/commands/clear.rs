//! Delete jobs.

use anyhow::Result;
use clap::Args;

use crate::client::Context;
use crate::output;

#[derive(Args)]
pub struct ClearArgs {
    /// Only delete jobs that failed permanently
    #[arg(long)]
    failed_only: bool,
}

pub async fn execute(args: ClearArgs, ctx: &Context) -> Result<()> {
    let deleted = ctx.queue().clear(args.failed_only).await?;
    let scope = if args.failed_only { "failed " } else { "" };
    output::print_success(&format!("Deleted {} {}job(s)", deleted, scope));
    Ok(())
}
