//! Cross-process directory locking.
//!
//! One directory, one `.processing.lock` file, one owner. All
//! synchronization happens through the on-disk artifact: creation is an
//! exclusive filesystem operation, ownership is the recorded pid, and an
//! orphaned lock (owner pid gone) is reclaimable by any process within a
//! single acquire call. In-process mutexes play no role here.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

pub const LOCK_FILE_NAME: &str = ".processing.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("directory {directory} already locked by process {owner_pid}")]
    AlreadyLocked { directory: PathBuf, owner_pid: u32 },

    #[error("lock on {directory} owned by process {owner_pid}, not {caller_pid}")]
    NotOwner {
        directory: PathBuf,
        owner_pid: u32,
        caller_pid: u32,
    },

    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(PathBuf),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Status recorded inside the lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Active,
    Completing,
    Failed,
}

/// The on-disk lock artifact.
///
/// Field names and encodings are a compatibility contract; unknown fields
/// written by other tooling are kept in `extra` and preserved on rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryLock {
    pub process_id: u32,
    pub created_at: DateTime<Utc>,
    pub directory: PathBuf,
    pub status: LockStatus,
    pub lock_file_path: PathBuf,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl DirectoryLock {
    /// Age-based advisory staleness. Reclamation authority is pid
    /// liveness, not age; this only feeds inspection reports.
    pub fn is_stale(&self, threshold_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.num_seconds() >= threshold_secs as i64
    }
}

/// Manages `.processing.lock` files for directories.
#[derive(Debug, Clone)]
pub struct LockManager {
    /// Advisory staleness threshold in seconds, from `lock.timeout`.
    stale_after: u64,
}

impl LockManager {
    pub fn new(stale_after: u64) -> Self {
        Self { stale_after }
    }

    pub fn lock_path(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE_NAME)
    }

    /// Acquire the lock on `dir` for the current process.
    ///
    /// Protocol: exclusive create; on conflict, parse the existing file.
    /// Corrupt or orphaned locks are reclaimed (delete + one retry). A
    /// live owner yields `AlreadyLocked`, as does losing the retry race
    /// to an intervening creator.
    pub fn acquire(&self, dir: &Path) -> Result<DirectoryLock, LockError> {
        if !dir.is_dir() {
            return Err(LockError::DirectoryUnavailable(dir.to_path_buf()));
        }

        if let Some(lock) = self.try_create(dir)? {
            return Ok(lock);
        }

        let path = Self::lock_path(dir);
        match self.read_lock(&path) {
            Ok(existing) => {
                if process_alive(existing.process_id) {
                    return Err(LockError::AlreadyLocked {
                        directory: dir.to_path_buf(),
                        owner_pid: existing.process_id,
                    });
                }
                warn!(
                    directory = %dir.display(),
                    owner_pid = existing.process_id,
                    "reclaiming orphaned lock"
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reclaiming corrupt lock file");
            }
        }

        // Delete and retry exactly once; an intervening creator wins.
        remove_if_present(&path)?;
        match self.try_create(dir)? {
            Some(lock) => Ok(lock),
            None => {
                let owner_pid = self.read_lock(&path).map(|l| l.process_id).unwrap_or(0);
                Err(LockError::AlreadyLocked {
                    directory: dir.to_path_buf(),
                    owner_pid,
                })
            }
        }
    }

    /// Release a lock held by the current process.
    ///
    /// Releasing someone else's lock is a programming error: it fails with
    /// `NotOwner` and deletes nothing.
    pub fn release(&self, lock: &DirectoryLock) -> Result<(), LockError> {
        let caller_pid = std::process::id();
        if lock.process_id != caller_pid {
            return Err(LockError::NotOwner {
                directory: lock.directory.clone(),
                owner_pid: lock.process_id,
                caller_pid,
            });
        }

        remove_if_present(&lock.lock_file_path)?;
        info!(directory = %lock.directory.display(), "released lock");
        Ok(())
    }

    /// Read the lock on `dir` without modifying anything.
    pub fn inspect(&self, dir: &Path) -> Result<Option<DirectoryLock>, LockError> {
        let path = Self::lock_path(dir);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_lock(&path)?))
    }

    /// Rewrite the lock file with a new status, preserving unknown fields.
    pub fn update_status(
        &self,
        lock: &mut DirectoryLock,
        status: LockStatus,
    ) -> Result<(), LockError> {
        let caller_pid = std::process::id();
        if lock.process_id != caller_pid {
            return Err(LockError::NotOwner {
                directory: lock.directory.clone(),
                owner_pid: lock.process_id,
                caller_pid,
            });
        }
        lock.status = status;
        let json = serde_json::to_string_pretty(lock).map_err(io_invalid)?;
        std::fs::write(&lock.lock_file_path, json)?;
        Ok(())
    }

    /// Reclaim the lock on `dir` if its owner is dead. Returns whether a
    /// lock file was removed. Used by the Master's orphan sweep.
    pub fn reclaim_orphan(&self, dir: &Path) -> Result<bool, LockError> {
        let path = Self::lock_path(dir);
        if !path.exists() {
            return Ok(false);
        }

        match self.read_lock(&path) {
            Ok(lock) => {
                if process_alive(lock.process_id) {
                    if lock.is_stale(self.stale_after) {
                        warn!(
                            directory = %dir.display(),
                            owner_pid = lock.process_id,
                            "lock exceeds staleness threshold but owner is alive; leaving it"
                        );
                    }
                    return Ok(false);
                }
                warn!(
                    directory = %dir.display(),
                    owner_pid = lock.process_id,
                    "sweeping orphaned lock"
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "sweeping corrupt lock file");
            }
        }

        remove_if_present(&path)?;
        Ok(true)
    }

    /// Exclusive create. `Ok(None)` means someone else holds the file.
    fn try_create(&self, dir: &Path) -> Result<Option<DirectoryLock>, LockError> {
        let path = Self::lock_path(dir);
        let lock = DirectoryLock {
            process_id: std::process::id(),
            created_at: Utc::now(),
            directory: dir.to_path_buf(),
            status: LockStatus::Active,
            lock_file_path: path.clone(),
            extra: serde_json::Map::new(),
        };

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let json = serde_json::to_string_pretty(&lock).map_err(io_invalid)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        info!(directory = %dir.display(), pid = lock.process_id, "acquired lock");
        Ok(Some(lock))
    }

    fn read_lock(&self, path: &Path) -> Result<DirectoryLock, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(io_invalid)
    }
}

fn io_invalid(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

fn remove_if_present(path: &Path) -> Result<(), std::io::Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a process with `pid` exists from this user's point of view.
///
/// `kill(pid, 0)` probes without signalling. `EPERM` means the pid exists
/// under another user: treated as alive, so we never reclaim a lock we
/// cannot verify.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::EPERM)
    )
}
