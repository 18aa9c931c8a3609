//! Scan command - process one directory inline and exit.
//!
//! Runs the same pipeline a spawned worker runs, but in this process,
//! with human-readable output instead of the IPC stream.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::facade::HttpFacade;
use crate::worker::Worker;
use crate::worker::ipc::{MessageSink, WorkerMessage};

#[derive(Args)]
pub struct ScanCmd {
    /// Directory to process
    pub directory: PathBuf,

    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Prints file decisions as they happen; everything else is dropped.
struct ConsoleSink;

impl MessageSink for ConsoleSink {
    fn send(&self, message: &WorkerMessage) {
        if let WorkerMessage::FileResult { result } = message {
            match &result.error {
                Some(error) => println!(
                    "  {} -> {:?} ({})",
                    result.path.display(),
                    result.status,
                    error.kind
                ),
                None => println!(
                    "  {} -> {:?} ({} chunks)",
                    result.path.display(),
                    result.status,
                    result.chunks
                ),
            }
        }
    }
}

impl ScanCmd {
    pub async fn run(&self) -> Result<()> {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .init();

        let config = Config::load(self.config.as_deref())?;
        config.validate().context("configuration invalid")?;

        let directory = self
            .directory
            .canonicalize()
            .with_context(|| format!("cannot resolve {}", self.directory.display()))?;

        let facade = HttpFacade::new(&config.upstream).context("building upstream clients")?;
        let sink = ConsoleSink;
        let worker = Worker::new(directory, &config, &facade, &sink, CancelFlag::new());

        println!("Processing {}", self.directory.display());
        let outcome = worker.run().await;
        let report = &outcome.report;

        println!();
        println!("State:      {:?}", report.state);
        println!("Seen:       {}", report.files_seen);
        println!("Processed:  {}", report.files_processed);
        println!("Skipped:    {}", report.files_skipped);
        println!("Failed:     {}", report.files_failed);
        println!("Chunks:     {}", report.chunks_created);

        std::process::exit(outcome.exit_code);
    }
}
