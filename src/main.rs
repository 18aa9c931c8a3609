//! docwatch CLI - directory watcher feeding a vector store.

use anyhow::Result;
use clap::Parser;
use docwatch::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.command.execute().await
}
