//! CLI argument definitions.

use clap::{Parser, Subcommand};

use crate::commands::{
    ConfigCmd, HealthCmd, QueueCmd, ScanCmd, ServeCmd, StatsCmd, StatusCmd, WorkerCmd,
};

#[derive(Parser)]
#[command(name = "docwatch")]
#[command(about = "Docwatch - watches directories and chunks documents into a vector store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the master daemon (admission, fleet, command surface)
    Serve(ServeCmd),

    /// Process one directory in this process and exit
    Scan(ScanCmd),

    /// Show master status and the worker fleet
    Status(StatusCmd),

    /// Show processing statistics
    Stats(StatsCmd),

    /// Check master and upstream service health
    Health(HealthCmd),

    /// Show the admission queue
    Queue(QueueCmd),

    /// Show or validate configuration
    Config(ConfigCmd),

    /// Run as a single-directory worker (spawned by the master)
    #[command(hide = true)]
    Worker(WorkerCmd),
}

impl Command {
    pub async fn execute(&self) -> anyhow::Result<()> {
        match self {
            Command::Serve(cmd) => cmd.run().await,
            Command::Scan(cmd) => cmd.run().await,
            Command::Status(cmd) => cmd.run().await,
            Command::Stats(cmd) => cmd.run().await,
            Command::Health(cmd) => cmd.run().await,
            Command::Queue(cmd) => cmd.run().await,
            Command::Config(cmd) => cmd.run().await,
            Command::Worker(cmd) => cmd.run().await,
        }
    }
}
