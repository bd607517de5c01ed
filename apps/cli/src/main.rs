//! Stitchwork CLI: ingestion-and-enrichment orchestrator.
//!
//! Accepts provider emits and retractions, runs enrichment workers against
//! the shared entity store, and inspects queue and canonical state.

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
