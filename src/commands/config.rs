//! Config command - show or validate configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args)]
pub struct ConfigCmd {
    #[command(subcommand)]
    pub command: ConfigSubCmd,
}

#[derive(Subcommand)]
pub enum ConfigSubCmd {
    /// Print the resolved configuration
    Show(ShowCmd),

    /// Check the configuration and exit non-zero if invalid
    Validate(ValidateCmd),
}

#[derive(Args)]
pub struct ShowCmd {
    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct ValidateCmd {
    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ConfigCmd {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            ConfigSubCmd::Show(cmd) => {
                let config = Config::load(cmd.config.as_deref())?;
                let path = match &cmd.config {
                    Some(path) => path.clone(),
                    None => Config::default_path()?,
                };
                println!("# {}", path.display());
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigSubCmd::Validate(cmd) => {
                let config = Config::load(cmd.config.as_deref())?;
                config.validate().context("configuration invalid")?;
                println!(
                    "OK: {} directories watched, fleet cap {}",
                    config.watch.directories.len(),
                    config.fleet.max_processes
                );
            }
        }
        Ok(())
    }
}
