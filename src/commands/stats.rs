//! Stats command - show processing statistics.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use super::client;

#[derive(Args)]
pub struct StatsCmd {
    /// Command surface URL (default: from config)
    #[arg(long)]
    pub url: Option<String>,

    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the raw JSON report
    #[arg(long)]
    pub json: bool,
}

impl StatsCmd {
    pub async fn run(&self) -> Result<()> {
        let url = client::surface_url(self.url.as_deref(), self.config.as_ref())?;
        let stats = client::call(&url, "get_processing_stats", Value::Null).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }

        println!("Files processed: {}", stats["files_processed"]);
        println!("Files skipped:   {}", stats["files_skipped"]);
        println!("Files failed:    {}", stats["files_failed"]);
        println!("Chunks created:  {}", stats["chunks_created"]);

        if let Some(reports) = stats["reports"].as_object() {
            if !reports.is_empty() {
                println!();
                println!("Last run per directory:");
                for (dir, report) in reports {
                    println!(
                        "  {} -> {} processed, {} failed, {} chunks",
                        dir,
                        report["files_processed"],
                        report["files_failed"],
                        report["chunks_created"],
                    );
                }
            }
        }

        if let Some(errors) = stats["recent_errors"].as_array() {
            if !errors.is_empty() {
                println!();
                println!("Recent errors ({}):", errors.len());
                for error in errors.iter().rev().take(10) {
                    println!(
                        "  [{}] {} at {}: {}",
                        error["kind"].as_str().unwrap_or("?"),
                        error["file"].as_str().unwrap_or("-"),
                        error["stage"].as_str().unwrap_or("?"),
                        error["cause"].as_str().unwrap_or(""),
                    );
                }
            }
        }

        Ok(())
    }
}
