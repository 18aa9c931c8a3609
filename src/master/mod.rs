//! The Master: fleet state, admission, and lifecycle.
//!
//! Owns the WorkerRecord table behind one coarse lock (mutations are
//! short; contention is negligible), spawns Worker child processes, reads
//! their message streams, enforces the fleet cap and the one-worker-per-
//! directory invariant, kills hung workers, sweeps orphaned locks, and
//! drains gracefully on shutdown.

pub mod surface;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::facade::VectorStore;
use crate::lock::LockManager;
use crate::models::{DirectoryReport, ErrorKind, ProcessingError, Stage, WorkerState};
use crate::worker::ipc::{ControlMessage, WorkerMessage};

/// Cap on the retained structured-error ring.
const ERROR_RING: usize = 100;

/// Master-side lifecycle of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FleetState {
    Pending,
    Starting,
    Running,
    Draining,
    Failed,
    Exited,
}

/// Master-side view of one Worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub pid: u32,
    pub directory: PathBuf,
    pub state: FleetState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_state: Option<WorkerState>,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub files_seen: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ProcessingError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl WorkerRecord {
    fn new(pid: u32, directory: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            pid,
            directory,
            state: FleetState::Starting,
            worker_state: None,
            started_at: now,
            last_message_at: now,
            files_seen: 0,
            files_processed: 0,
            files_failed: 0,
            last_error: None,
            exit_code: None,
        }
    }
}

/// A live child: its record plus the handles the Master keeps.
struct RunningWorker {
    record: WorkerRecord,
    /// Control channel into the child; `None` in tests.
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
    /// One-shot trigger that makes the waiter task kill the child.
    kill: Option<oneshot::Sender<()>>,
}

/// Everything behind the coarse lock.
#[derive(Default)]
struct Fleet {
    admission_open: bool,
    watched: BTreeSet<PathBuf>,
    pending: VecDeque<PathBuf>,
    running: HashMap<PathBuf, RunningWorker>,
    /// Terminal records, retained for reporting until replaced by a
    /// newer run of the same directory.
    recent: HashMap<PathBuf, WorkerRecord>,
    reports: HashMap<PathBuf, DirectoryReport>,
    errors: VecDeque<ProcessingError>,
}

impl Fleet {
    fn push_error(&mut self, error: ProcessingError) {
        if self.errors.len() == ERROR_RING {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
    }

    /// Enqueue a directory unless a worker already owns it or it is
    /// already queued.
    fn admit(&mut self, dir: &Path) -> bool {
        if self.running.contains_key(dir) || self.pending.iter().any(|d| d == dir) {
            return false;
        }
        self.pending.push_back(dir.to_path_buf());
        true
    }
}

pub struct Master {
    config: Config,
    config_path: Option<PathBuf>,
    fleet: Arc<Mutex<Fleet>>,
    locks: LockManager,
    facade: Arc<dyn VectorStore>,
    started_at: DateTime<Utc>,
}

impl Master {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        facade: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let mut fleet = Fleet::default();
        fleet.admission_open = true;
        fleet.watched = config.watch.directories.iter().cloned().collect();

        Ok(Self {
            locks: LockManager::new(config.lock.timeout),
            config,
            config_path,
            fleet: Arc::new(Mutex::new(fleet)),
            facade,
            started_at: Utc::now(),
        })
    }

    /// Run admission, monitoring, sweeping, and the command surface until
    /// a shutdown signal arrives, then drain.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            directories = self.fleet.lock().unwrap().watched.len(),
            max_processes = self.config.fleet.max_processes,
            "master starting"
        );

        // Reclaim anything a previous run left behind before admitting.
        self.sweep_orphan_locks();

        let bind: std::net::SocketAddr = self
            .config
            .surface
            .bind
            .parse()
            .context("invalid surface.bind")?;
        let surface = tokio::spawn(surface::serve(self.clone(), bind));

        let mut admission = tokio::time::interval(Duration::from_secs(self.config.watch.scan_interval));
        let mut monitor = tokio::time::interval(Duration::from_secs(1));
        let mut sweep = tokio::time::interval(Duration::from_secs(self.config.watch.scan_interval));

        loop {
            tokio::select! {
                _ = admission.tick() => {
                    self.admit_watched();
                    self.spawn_pending().await;
                }
                _ = monitor.tick() => {
                    self.terminate_hung_workers();
                    self.spawn_pending().await;
                }
                _ = sweep.tick() => {
                    self.sweep_orphan_locks();
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received, draining");
                    break;
                }
            }
        }

        surface.abort();
        self.drain().await;
        Ok(())
    }

    /// Queue every watched directory that has no live worker.
    fn admit_watched(&self) {
        let mut fleet = self.fleet.lock().unwrap();
        if !fleet.admission_open {
            return;
        }
        let watched: Vec<PathBuf> = fleet.watched.iter().cloned().collect();
        for dir in watched {
            fleet.admit(&dir);
        }
    }

    /// Spawn queued directories while the fleet cap allows.
    async fn spawn_pending(&self) {
        loop {
            let next = {
                let mut fleet = self.fleet.lock().unwrap();
                if !fleet.admission_open
                    || fleet.running.len() >= self.config.fleet.max_processes
                {
                    return;
                }
                fleet.pending.pop_front()
            };
            let Some(dir) = next else { return };

            if let Err(e) = self.spawn_worker(&dir).await {
                // The directory stays watched; the next admission tick
                // re-queues it.
                error!(directory = %dir.display(), error = %e, "failed to spawn worker");
            }
        }
    }

    async fn spawn_worker(&self, dir: &Path) -> Result<()> {
        let exe = std::env::current_exe().context("cannot locate own executable")?;

        let mut command = Command::new(exe);
        command
            .arg("worker")
            .arg("--directory")
            .arg(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }

        let mut child = command.spawn().context("spawning worker process")?;
        let pid = child.id().unwrap_or(0);
        let stdout = child
            .stdout
            .take()
            .context("worker stdout not captured")?;
        let stdin = child.stdin.take().context("worker stdin not captured")?;

        info!(directory = %dir.display(), pid, "worker spawned");

        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut fleet = self.fleet.lock().unwrap();
            fleet.running.insert(
                dir.to_path_buf(),
                RunningWorker {
                    record: WorkerRecord::new(pid, dir.to_path_buf()),
                    stdin: Some(Arc::new(tokio::sync::Mutex::new(stdin))),
                    kill: Some(kill_tx),
                },
            );
        }

        // Message pump: one task per child, feeding the shared table.
        let fleet = self.fleet.clone();
        let pump_dir = dir.to_path_buf();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match WorkerMessage::parse(&line) {
                    Some(message) => on_message(&fleet, &pump_dir, message),
                    None => warn!(directory = %pump_dir.display(), "undecodable worker line"),
                }
            }
        });

        // Waiter: reaps the child, or kills it when told to.
        let fleet = self.fleet.clone();
        let locks = self.locks.clone();
        let wait_dir = dir.to_path_buf();
        tokio::spawn(async move {
            let code = wait_or_kill(child, kill_rx).await;
            on_exit(&fleet, &locks, &wait_dir, code);
        });

        Ok(())
    }

    /// Kill workers that have been silent past `heartbeat.timeout`.
    fn terminate_hung_workers(&self) {
        let timeout = self.config.heartbeat.timeout_duration();
        let now = Utc::now();

        let mut fleet = self.fleet.lock().unwrap();
        for (dir, worker) in fleet.running.iter_mut() {
            let silent = now
                .signed_duration_since(worker.record.last_message_at)
                .to_std()
                .unwrap_or_default();
            if silent < timeout || worker.kill.is_none() {
                continue;
            }

            warn!(
                directory = %dir.display(),
                pid = worker.record.pid,
                silent_secs = silent.as_secs(),
                "worker hung, terminating"
            );
            worker.record.state = FleetState::Failed;
            worker.record.last_error = Some(
                ProcessingError::new(
                    ErrorKind::HeartbeatTimeout,
                    Stage::Finalizing,
                    format!("no message for {}s", silent.as_secs()),
                )
                .with_directory(dir),
            );
            if let Some(kill) = worker.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    /// Reclaim orphaned locks in every watched directory that has no
    /// live worker of ours.
    fn sweep_orphan_locks(&self) {
        let dirs: Vec<PathBuf> = {
            let fleet = self.fleet.lock().unwrap();
            fleet
                .watched
                .iter()
                .filter(|d| !fleet.running.contains_key(*d))
                .cloned()
                .collect()
        };

        for dir in dirs {
            match self.locks.reclaim_orphan(&dir) {
                Ok(true) => info!(directory = %dir.display(), "orphaned lock reclaimed"),
                Ok(false) => {}
                Err(e) => warn!(directory = %dir.display(), error = %e, "orphan sweep failed"),
            }
        }
    }

    /// Stop admission, cancel all workers, wait out the grace period,
    /// then force-kill survivors and reclaim their locks.
    pub async fn drain(&self) {
        let stdins: Vec<(PathBuf, Arc<tokio::sync::Mutex<ChildStdin>>)> = {
            let mut fleet = self.fleet.lock().unwrap();
            fleet.admission_open = false;
            fleet.pending.clear();
            fleet
                .running
                .iter_mut()
                .filter_map(|(dir, worker)| {
                    worker.record.state = FleetState::Draining;
                    worker.stdin.clone().map(|s| (dir.clone(), s))
                })
                .collect()
        };

        for (dir, stdin) in &stdins {
            info!(directory = %dir.display(), "sending stop");
            let mut stdin = stdin.lock().await;
            let _ = stdin
                .write_all(ControlMessage::Stop.as_line().as_bytes())
                .await;
            let _ = stdin.flush().await;
        }

        let grace = self.config.heartbeat.timeout_duration();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.fleet.lock().unwrap().running.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Force-terminate whoever is left.
        {
            let mut fleet = self.fleet.lock().unwrap();
            for (dir, worker) in fleet.running.iter_mut() {
                if let Some(kill) = worker.kill.take() {
                    warn!(directory = %dir.display(), "grace elapsed, force-terminating");
                    let _ = kill.send(());
                }
            }
        }

        // Give the waiter tasks a moment to reap, then sweep locks.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.sweep_orphan_locks();
        info!("drain complete");
    }

    // ── Command-surface projections ──

    pub fn start_watching(&self, dir: &Path) -> Result<bool> {
        if !dir.is_absolute() {
            anyhow::bail!("directory must be absolute: {}", dir.display());
        }
        let mut fleet = self.fleet.lock().unwrap();
        let added = fleet.watched.insert(dir.to_path_buf());
        if fleet.admission_open {
            fleet.admit(dir);
        }
        Ok(added)
    }

    pub async fn stop_watching(&self, dir: &Path) -> Result<bool> {
        let (was_watched, stdin) = {
            let mut fleet = self.fleet.lock().unwrap();
            let was_watched = fleet.watched.remove(dir);
            fleet.pending.retain(|d| d != dir);
            let stdin = fleet.running.get_mut(dir).and_then(|worker| {
                worker.record.state = FleetState::Draining;
                worker.stdin.clone()
            });
            (was_watched, stdin)
        };

        if let Some(stdin) = stdin {
            let mut stdin = stdin.lock().await;
            stdin
                .write_all(ControlMessage::Stop.as_line().as_bytes())
                .await
                .context("writing stop to worker")?;
            stdin.flush().await.context("flushing worker stdin")?;
        }

        Ok(was_watched)
    }

    pub fn list_watched(&self) -> Vec<PathBuf> {
        self.fleet.lock().unwrap().watched.iter().cloned().collect()
    }

    pub fn watch_status(&self, dir: &Path) -> serde_json::Value {
        let fleet = self.fleet.lock().unwrap();
        let record = fleet
            .running
            .get(dir)
            .map(|w| &w.record)
            .or_else(|| fleet.recent.get(dir));
        serde_json::json!({
            "directory": dir,
            "watched": fleet.watched.contains(dir),
            "worker": record,
            "report": fleet.reports.get(dir),
            "lock": self.locks.inspect(dir).ok().flatten(),
        })
    }

    pub fn system_stats(&self) -> serde_json::Value {
        let fleet = self.fleet.lock().unwrap();
        serde_json::json!({
            "uptime_secs": Utc::now().signed_duration_since(self.started_at).num_seconds(),
            "pid": std::process::id(),
            "watched_directories": fleet.watched.len(),
            "workers_running": fleet.running.len(),
            "workers_pending": fleet.pending.len(),
            "max_processes": self.config.fleet.max_processes,
        })
    }

    pub fn processing_stats(&self) -> serde_json::Value {
        let fleet = self.fleet.lock().unwrap();
        let totals = fleet.reports.values().fold((0u64, 0u64, 0u64, 0u64), |acc, r| {
            (
                acc.0 + r.files_processed,
                acc.1 + r.files_skipped,
                acc.2 + r.files_failed,
                acc.3 + r.chunks_created,
            )
        });
        serde_json::json!({
            "files_processed": totals.0,
            "files_skipped": totals.1,
            "files_failed": totals.2,
            "chunks_created": totals.3,
            "reports": fleet.reports,
            "recent_errors": fleet.errors,
        })
    }

    pub fn queue_status(&self) -> serde_json::Value {
        let fleet = self.fleet.lock().unwrap();
        let running: Vec<&WorkerRecord> = fleet.running.values().map(|w| &w.record).collect();
        serde_json::json!({
            "pending": fleet.pending,
            "running": running,
            "recent": fleet.recent,
        })
    }

    pub async fn health_check(&self) -> serde_json::Value {
        let upstream = self.facade.health().await;
        let fleet = self.fleet.lock().unwrap();
        let degraded = upstream.values().any(|s| !s.healthy);
        serde_json::json!({
            "status": if degraded { "degraded" } else { "ok" },
            "uptime_secs": Utc::now().signed_duration_since(self.started_at).num_seconds(),
            "workers_running": fleet.running.len(),
            "admission_open": fleet.admission_open,
            "upstream": upstream,
        })
    }
}

/// Apply one worker message to the shared table.
fn on_message(fleet: &Mutex<Fleet>, dir: &Path, message: WorkerMessage) {
    let mut fleet = fleet.lock().unwrap();

    match &message {
        WorkerMessage::Final { report } => {
            fleet.reports.insert(dir.to_path_buf(), report.clone());
        }
        WorkerMessage::Error { error } => {
            fleet.push_error(error.clone());
        }
        _ => {}
    }

    let Some(worker) = fleet.running.get_mut(dir) else {
        return;
    };
    worker.record.last_message_at = Utc::now();

    match message {
        WorkerMessage::Stage { state } => {
            worker.record.state = FleetState::Running;
            worker.record.worker_state = Some(state);
        }
        WorkerMessage::Progress {
            files_seen,
            files_processed,
            files_failed,
            ..
        } => {
            worker.record.files_seen = files_seen;
            worker.record.files_processed = files_processed;
            worker.record.files_failed = files_failed;
        }
        WorkerMessage::FileResult { result } => {
            if result.status == crate::models::FileStatus::Failed {
                worker.record.files_failed += 1;
            } else {
                worker.record.files_processed += 1;
            }
        }
        WorkerMessage::Error { error } => {
            worker.record.last_error = Some(error);
        }
        WorkerMessage::Heartbeat { .. } | WorkerMessage::Final { .. } => {}
    }
}

/// Move a reaped child from running to recent, and reclaim its lock if
/// it died without releasing.
fn on_exit(fleet: &Mutex<Fleet>, locks: &LockManager, dir: &Path, exit_code: Option<i32>) {
    let record = {
        let mut fleet = fleet.lock().unwrap();
        let Some(worker) = fleet.running.remove(dir) else {
            return;
        };
        let mut record = worker.record;
        record.exit_code = exit_code;
        record.state = match exit_code {
            Some(crate::worker::EXIT_FAILED) | None => FleetState::Failed,
            Some(_) => FleetState::Exited,
        };
        fleet.recent.insert(dir.to_path_buf(), record.clone());
        record
    };

    info!(
        directory = %dir.display(),
        pid = record.pid,
        exit_code = record.exit_code,
        "worker exited"
    );

    // A clean worker removed its own lock; this only fires for crashes
    // and kills, where the owning pid is gone.
    if let Err(e) = locks.reclaim_orphan(dir) {
        warn!(directory = %dir.display(), error = %e, "post-exit lock reclaim failed");
    }
}

/// Wait for the child, or kill it when the trigger fires first.
async fn wait_or_kill(mut child: Child, kill: oneshot::Receiver<()>) -> Option<i32> {
    tokio::select! {
        status = child.wait() => status.ok().and_then(|s| s.code()),
        _ = kill => {
            let _ = child.kill().await;
            child.wait().await.ok().and_then(|s| s.code())
        }
    }
}
