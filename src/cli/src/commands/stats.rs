//! Queue statistics.

use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;

use deferred_core::backend::Backend;

use crate::client::Context;
use crate::output::{self, OutputFormat};

#[derive(Tabled, Serialize)]
struct StateRow {
    #[tabled(rename = "State")]
    state: &'static str,
    #[tabled(rename = "Jobs")]
    count: u64,
}

pub async fn execute(ctx: &Context, format: OutputFormat) -> Result<()> {
    let stats = ctx.queue().stats().await?;

    match format {
        OutputFormat::Table => {
            let info = ctx.backend().info();
            output::print_header("Job Queue");
            output::print_detail("Database", &info.database);
            output::print_detail("Table", &info.table);
            println!();

            let rows = [
                StateRow { state: "ready", count: stats.ready },
                StateRow { state: "scheduled", count: stats.scheduled },
                StateRow { state: "locked", count: stats.locked },
                StateRow { state: "failed", count: stats.failed },
                StateRow { state: "total", count: stats.total() },
            ];
            output::print_list(&rows, format)
        }
        _ => output::print_item(&stats, format),
    }
}
