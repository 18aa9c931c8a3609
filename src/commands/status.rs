//! Status command - show master status and the worker fleet.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};

use super::client;

#[derive(Args)]
pub struct StatusCmd {
    /// Command surface URL (default: from config)
    #[arg(long)]
    pub url: Option<String>,

    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl StatusCmd {
    pub async fn run(&self) -> Result<()> {
        let url = client::surface_url(self.url.as_deref(), self.config.as_ref())?;

        let system = client::call(&url, "get_system_stats", Value::Null).await?;
        let queue = client::call(&url, "get_queue_status", Value::Null).await?;
        let watched = client::call(&url, "list_watched_directories", Value::Null).await?;

        println!("Master:      pid {}", system["pid"]);
        println!("Uptime:      {}s", system["uptime_secs"]);
        println!(
            "Workers:     {} running, {} pending (cap {})",
            system["workers_running"], system["workers_pending"], system["max_processes"]
        );
        println!();

        let directories = watched["directories"].as_array().cloned().unwrap_or_default();
        println!("Watched directories: {}", directories.len());
        for dir in &directories {
            println!("  {}", dir.as_str().unwrap_or("?"));
        }

        let running = queue["running"].as_array().cloned().unwrap_or_default();
        if !running.is_empty() {
            println!();
            println!("Running workers:");
            for worker in &running {
                println!(
                    "  {} pid={} state={} processed={} failed={}",
                    worker["directory"].as_str().unwrap_or("?"),
                    worker["pid"],
                    worker["worker_state"].as_str().unwrap_or("starting"),
                    worker["files_processed"],
                    worker["files_failed"],
                );
            }
        }

        let empty = json!({});
        let recent = queue["recent"].as_object().unwrap_or(empty.as_object().unwrap());
        if !recent.is_empty() {
            println!();
            println!("Recent runs:");
            for (dir, record) in recent {
                println!(
                    "  {} exit={} state={}",
                    dir,
                    record["exit_code"],
                    record["state"].as_str().unwrap_or("?"),
                );
            }
        }

        Ok(())
    }
}
