//! Health command - check master and upstream service health.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use super::client;

#[derive(Args)]
pub struct HealthCmd {
    /// Command surface URL (default: from config)
    #[arg(long)]
    pub url: Option<String>,

    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl HealthCmd {
    pub async fn run(&self) -> Result<()> {
        let url = client::surface_url(self.url.as_deref(), self.config.as_ref())?;
        let health = client::call(&url, "health_check", Value::Null).await?;

        println!("Status:   {}", health["status"].as_str().unwrap_or("?"));
        println!("Uptime:   {}s", health["uptime_secs"]);
        println!("Workers:  {}", health["workers_running"]);
        println!();
        println!("Upstream services:");
        if let Some(upstream) = health["upstream"].as_object() {
            for (name, service) in upstream {
                let healthy = service["healthy"].as_bool().unwrap_or(false);
                match service["detail"].as_str() {
                    Some(detail) if !healthy => {
                        println!("  {name:<13} down ({detail})");
                    }
                    _ => {
                        println!("  {name:<13} {}", if healthy { "ok" } else { "down" });
                    }
                }
            }
        }

        Ok(())
    }
}
