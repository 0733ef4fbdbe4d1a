//! Apply the embedded schema migrations.

use anyhow::{Context as _, Result};

use crate::client::Context;
use crate::output;

pub async fn execute(ctx: &Context) -> Result<()> {
    ctx.backend()
        .migrate()
        .await
        .context("Failed to apply migrations")?;
    output::print_success("Migrations applied");
    Ok(())
}
