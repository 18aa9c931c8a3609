//! Queue command - show the admission queue.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use super::client;

#[derive(Args)]
pub struct QueueCmd {
    /// Command surface URL (default: from config)
    #[arg(long)]
    pub url: Option<String>,

    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl QueueCmd {
    pub async fn run(&self) -> Result<()> {
        let url = client::surface_url(self.url.as_deref(), self.config.as_ref())?;
        let queue = client::call(&url, "get_queue_status", Value::Null).await?;

        let pending = queue["pending"].as_array().cloned().unwrap_or_default();
        println!("Pending ({}):", pending.len());
        for dir in &pending {
            println!("  {}", dir.as_str().unwrap_or("?"));
        }

        let running = queue["running"].as_array().cloned().unwrap_or_default();
        println!();
        println!("Running ({}):", running.len());
        for worker in &running {
            println!(
                "  {} pid={} state={}",
                worker["directory"].as_str().unwrap_or("?"),
                worker["pid"],
                worker["worker_state"].as_str().unwrap_or("starting"),
            );
        }

        Ok(())
    }
}
