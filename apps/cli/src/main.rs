//! KnowTree CLI: turn a question into an ordered, enriched explanation.
//!
//! Builds a tree of prerequisite concepts for the request, enriches it with
//! mathematics, visual designs and a narrative, and writes the result as a
//! run directory.

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
