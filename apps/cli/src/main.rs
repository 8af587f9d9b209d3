//! Tastebase CLI: enrich and verify the chef/restaurant/show database.
//!
//! Every enrichment runs as a workflow with cost gating, duplicate checks,
//! and an audit trail. `--dry-run` performs the lookups but writes nothing.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
