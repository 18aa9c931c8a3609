//! Worker lifecycle states and the reports a run produces.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ProcessingError;
use super::file::FileStatus;

/// Worker state machine.
///
/// ```text
/// Spawned → Locking → Scanning → Diffing → Processing → Finalizing → Exited
///                   ↘ LockDenied → Exited
///                               ↘ Failed → Exited
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Spawned,
    Locking,
    Scanning,
    Diffing,
    Processing,
    Finalizing,
    LockDenied,
    Failed,
    Cancelled,
    Exited,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::LockDenied
                | WorkerState::Failed
                | WorkerState::Cancelled
                | WorkerState::Exited
        )
    }
}

/// Outcome of one decided file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub status: FileStatus,

    /// Chunks committed for this file (zero unless `Committed`).
    pub chunks: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProcessingError>,
}

/// Terminal summary of one directory run, emitted by the Worker in its
/// `Final` message and retained by the Master for the stats surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryReport {
    pub directory: PathBuf,
    pub state: WorkerState,

    pub files_seen: u64,
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub chunks_created: u64,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProcessingError>,
}

impl DirectoryReport {
    pub fn empty(directory: impl Into<PathBuf>, state: WorkerState) -> Self {
        let now = Utc::now();
        Self {
            directory: directory.into(),
            state,
            files_seen: 0,
            files_processed: 0,
            files_skipped: 0,
            files_failed: 0,
            chunks_created: 0,
            started_at: now,
            finished_at: now,
            errors: Vec::new(),
        }
    }

    /// Fold one decided file into the totals.
    pub fn record(&mut self, result: &FileResult) {
        match result.status {
            FileStatus::Committed => {
                self.files_processed += 1;
                self.chunks_created += result.chunks;
            }
            FileStatus::Failed => self.files_failed += 1,
            _ => self.files_skipped += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(WorkerState::Exited.is_terminal());
        assert!(WorkerState::LockDenied.is_terminal());
        assert!(!WorkerState::Processing.is_terminal());
    }

    #[test]
    fn test_report_tallies() {
        let mut report = DirectoryReport::empty("/tmp/docs", WorkerState::Processing);
        report.record(&FileResult {
            path: "/tmp/docs/a.md".into(),
            status: FileStatus::Committed,
            chunks: 5,
            error: None,
        });
        report.record(&FileResult {
            path: "/tmp/docs/b.txt".into(),
            status: FileStatus::SkippedEmpty,
            chunks: 0,
            error: None,
        });
        report.record(&FileResult {
            path: "/tmp/docs/c.txt".into(),
            status: FileStatus::Failed,
            chunks: 0,
            error: None,
        });

        assert_eq!(report.files_processed, 1);
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.chunks_created, 5);
    }
}
