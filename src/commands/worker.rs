//! Worker command - process one directory as a master-spawned child.
//!
//! Hidden from help. stdout is reserved for the IPC message stream, so
//! logging goes to stderr; stdin carries control lines from the master.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::facade::HttpFacade;
use crate::worker::ipc::{ControlMessage, MessageSink, StdoutSink, WorkerMessage};
use crate::worker::{EXIT_FAILED, Worker};

#[derive(Args)]
pub struct WorkerCmd {
    /// Directory to process
    #[arg(long)]
    pub directory: PathBuf,

    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl WorkerCmd {
    pub async fn run(&self) -> Result<()> {
        // Logging to stderr (stdout is the message channel).
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();

        let config = match Config::load(self.config.as_deref()).and_then(|c| {
            c.validate()?;
            Ok(c)
        }) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("worker: configuration error: {e:#}");
                std::process::exit(EXIT_FAILED);
            }
        };

        let facade = match HttpFacade::new(&config.upstream) {
            Ok(facade) => facade,
            Err(e) => {
                eprintln!("worker: upstream client error: {e}");
                std::process::exit(EXIT_FAILED);
            }
        };

        let cancel = CancelFlag::new();

        // Control listener: a `stop` line flips the cancel flag.
        let control = cancel.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if ControlMessage::parse(&line) == Some(ControlMessage::Stop) {
                    control.set();
                }
            }
        });

        // Heartbeats on the configured cadence, independent of progress.
        let interval = config.heartbeat.interval_duration();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                StdoutSink.send(&WorkerMessage::Heartbeat { at: Utc::now() });
            }
        });

        let sink = StdoutSink;
        let worker = Worker::new(
            self.directory.clone(),
            &config,
            &facade,
            &sink,
            cancel,
        );

        let outcome = worker.run().await;
        std::process::exit(outcome.exit_code);
    }
}
