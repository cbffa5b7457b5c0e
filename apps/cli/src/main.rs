//! specextract CLI — procurement specification item extraction.
//!
//! Turns HTML renderings of procurement technical specifications into
//! markdown and structured item lists, keyed by the producing model.

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
