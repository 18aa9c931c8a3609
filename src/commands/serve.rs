//! Serve command - run the master daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::facade::HttpFacade;
use crate::master::Master;

#[derive(Args)]
pub struct ServeCmd {
    /// Config file path (default: ~/.config/docwatch/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServeCmd {
    pub async fn run(&self) -> Result<()> {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();

        let config = Config::load(self.config.as_deref())?;
        config
            .validate()
            .context("configuration invalid, refusing to start")?;

        let facade =
            Arc::new(HttpFacade::new(&config.upstream).context("building upstream clients")?);
        let master = Arc::new(Master::new(config, self.config.clone(), facade)?);

        master.run().await
    }
}
