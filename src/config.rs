//! Configuration loading and validation.
//!
//! Config is a TOML file (default `~/.config/docwatch/config.toml`,
//! overridable with `--config`). Every section has serde defaults so a
//! missing file yields a runnable configuration; `validate()` is called
//! once at startup and its failure is fatal (`ConfigInvalid`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

const CONFIG_DIR: &str = "docwatch";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration snapshot.
///
/// Cloned into the Master and each Worker at startup; never reloaded
/// mid-run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub surface: SurfaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    /// Absolute paths of the directories to watch.
    #[serde(default)]
    pub directories: Vec<PathBuf>,

    /// Allowed extensions, without the dot.
    #[serde(default = "default_formats")]
    pub supported_formats: Vec<String>,

    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Maximum file size in bytes; larger files are skipped unparsed.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Seconds between admission sweeps over the directory set.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,

    /// Glob patterns; a non-empty include list is exclusive.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Emit a progress message every N processed files.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    /// Concurrent Worker cap.
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Advisory staleness threshold in seconds, used by `inspect` reports
    /// only. Liveness of the owning pid is the reclamation authority.
    #[serde(default = "default_lock_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Maximum body length per chunk, in bytes.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Commit batch size ceiling.
    #[serde(default = "default_max_blocks_per_batch")]
    pub max_blocks_per_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default = "default_vector_store")]
    pub vector_store: ServiceConfig,
    #[serde(default = "default_segmentation")]
    pub segmentation: ServiceConfig,
    #[serde(default = "default_embedding")]
    pub embedding: ServiceConfig,
}

/// Endpoint and policy for one upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub url: String,

    /// Per-attempt timeout in seconds.
    #[serde(default = "default_service_timeout")]
    pub timeout: u64,

    /// Per-call retry ceiling, overriding `retry.max_attempts` when set.
    #[serde(default)]
    pub retries: Option<u32>,
}

impl ServiceConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Backoff base delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn base_delay_duration(&self) -> Duration {
        Duration::from_millis(self.base_delay)
    }

    pub fn max_delay_duration(&self) -> Duration {
        Duration::from_millis(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    /// Seconds between Worker heartbeat messages.
    #[serde(default = "default_heartbeat_interval")]
    pub interval: u64,

    /// Seconds of silence after which a Worker is declared hung.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout: u64,
}

impl HeartbeatConfig {
    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SurfaceConfig {
    /// Bind address of the JSON-RPC command endpoint.
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_formats() -> Vec<String> {
    vec!["txt".to_string(), "md".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_scan_interval() -> u64 {
    300
}

fn default_progress_every() -> u64 {
    1
}

fn default_max_processes() -> usize {
    4
}

fn default_lock_timeout() -> u64 {
    3600
}

fn default_max_block_size() -> usize {
    1000
}

fn default_max_blocks_per_batch() -> usize {
    100
}

fn default_vector_store() -> ServiceConfig {
    ServiceConfig {
        url: "http://127.0.0.1:8007".to_string(),
        timeout: default_service_timeout(),
        retries: None,
    }
}

fn default_segmentation() -> ServiceConfig {
    ServiceConfig {
        url: "http://127.0.0.1:8009".to_string(),
        timeout: default_service_timeout(),
        retries: None,
    }
}

fn default_embedding() -> ServiceConfig {
    ServiceConfig {
        url: "http://127.0.0.1:8001".to_string(),
        timeout: default_service_timeout(),
        retries: None,
    }
}

fn default_service_timeout() -> u64 {
    30
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            supported_formats: default_formats(),
            recursive: true,
            max_file_size: default_max_file_size(),
            scan_interval: default_scan_interval(),
            include: Vec::new(),
            exclude: Vec::new(),
            progress_every: default_progress_every(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_processes: default_max_processes(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_block_size: default_max_block_size(),
            max_blocks_per_batch: default_max_blocks_per_batch(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            vector_store: default_vector_store(),
            segmentation: default_segmentation(),
            embedding: default_embedding(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            timeout: default_heartbeat_timeout(),
        }
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Config {
    /// Load config from an explicit path, or the default location.
    /// A missing default file yields `Config::default()`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = Self::default_path()?;
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Check the cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        for dir in &self.watch.directories {
            if !dir.is_absolute() {
                bail!("watch.directories entries must be absolute, got {}", dir.display());
            }
        }
        if self.watch.progress_every == 0 {
            bail!("watch.progress_every must be at least 1");
        }
        if self.fleet.max_processes == 0 {
            bail!("fleet.max_processes must be at least 1");
        }
        if self.chunking.max_block_size == 0 {
            bail!("chunking.max_block_size must be positive");
        }
        if self.chunking.max_blocks_per_batch == 0 {
            bail!("chunking.max_blocks_per_batch must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay > self.retry.max_delay {
            bail!(
                "retry.base_delay ({}) exceeds retry.max_delay ({})",
                self.retry.base_delay,
                self.retry.max_delay
            );
        }
        if self.heartbeat.timeout <= self.heartbeat.interval {
            bail!("heartbeat.timeout must exceed heartbeat.interval");
        }
        for (name, svc) in [
            ("vector_store", &self.upstream.vector_store),
            ("segmentation", &self.upstream.segmentation),
            ("embedding", &self.upstream.embedding),
        ] {
            svc.url
                .parse::<reqwest::Url>()
                .with_context(|| format!("upstream.{name}.url is not a valid URL: {}", svc.url))?;
            if svc.timeout == 0 {
                bail!("upstream.{name}.timeout must be positive");
            }
        }
        self.surface
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("surface.bind is not a socket address: {}", self.surface.bind))?;
        Ok(())
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("could not determine config directory")?;
        Ok(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }
}
